//! Graph schema: which node label each entity tag maps to.

use crate::vocabulary::Vocabulary;
use cypherloom_core::EntityTag;
use std::collections::BTreeMap;

/// Maps entity tags to node labels. Labels are caller-defined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphSchema {
    labels: BTreeMap<EntityTag, String>,
    default_entity: Option<EntityTag>,
}

impl GraphSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every vocabulary entity, labelled with its own tag.
    pub fn from_vocabulary(vocabulary: &Vocabulary) -> Self {
        let labels = vocabulary
            .entity_tags()
            .map(|tag| (tag.clone(), tag.as_str().to_string()))
            .collect();
        Self {
            labels,
            default_entity: None,
        }
    }

    pub fn with_entity(mut self, tag: impl Into<EntityTag>, label: impl Into<String>) -> Self {
        self.labels.insert(tag.into(), label.into());
        self
    }

    /// Entity matched when an intent names none.
    pub fn with_default_entity(mut self, tag: impl Into<EntityTag>) -> Self {
        self.default_entity = Some(tag.into());
        self
    }

    /// Replace labels for the given tags, adding tags not yet known.
    pub fn override_labels<'a, I>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (tag, label) in overrides {
            self.labels.insert(EntityTag::new(tag.clone()), label.clone());
        }
        self
    }

    pub fn label_for(&self, tag: &EntityTag) -> Option<&str> {
        self.labels.get(tag).map(String::as_str)
    }

    pub fn default_entity(&self) -> Option<&EntityTag> {
        self.default_entity.as_ref()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_schema_uses_tags_as_labels() {
        let schema = GraphSchema::from_vocabulary(&Vocabulary::default());
        assert_eq!(schema.label_for(&EntityTag::from("vendor")), Some("vendor"));
        assert_eq!(schema.label_for(&EntityTag::from("spaceship")), None);
        assert!(schema.len() >= 6);
    }

    #[test]
    fn overrides_replace_labels() {
        let overrides = BTreeMap::from([("vendor".to_string(), "Vendor".to_string())]);
        let schema = GraphSchema::from_vocabulary(&Vocabulary::default())
            .override_labels(&overrides)
            .with_default_entity("vendor");
        assert_eq!(schema.label_for(&EntityTag::from("vendor")), Some("Vendor"));
        assert_eq!(schema.default_entity(), Some(&EntityTag::from("vendor")));
    }
}
