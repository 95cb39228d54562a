//! Language definitions used to validate mutations
//!
//! A language lists, per classifier, which features exist and their
//! multiplicity. Classifiers the language does not mention are not checked.

use std::collections::HashMap;

use crate::ids::MetaPointer;

use super::ModelError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureKind {
    Property,
    Containment,
    Reference,
}

/// Specification for one feature of a classifier
#[derive(Clone, Debug)]
pub struct FeatureSpec {
    pub key: MetaPointer,
    pub kind: FeatureKind,
    pub multiple: bool,
}

impl FeatureSpec {
    pub fn property(key: MetaPointer) -> Self {
        Self {
            key,
            kind: FeatureKind::Property,
            multiple: false,
        }
    }

    pub fn single_containment(key: MetaPointer) -> Self {
        Self {
            key,
            kind: FeatureKind::Containment,
            multiple: false,
        }
    }

    pub fn multiple_containment(key: MetaPointer) -> Self {
        Self {
            key,
            kind: FeatureKind::Containment,
            multiple: true,
        }
    }

    pub fn single_reference(key: MetaPointer) -> Self {
        Self {
            key,
            kind: FeatureKind::Reference,
            multiple: false,
        }
    }

    pub fn multiple_reference(key: MetaPointer) -> Self {
        Self {
            key,
            kind: FeatureKind::Reference,
            multiple: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClassifierSpec {
    pub classifier: MetaPointer,
    pub features: Vec<FeatureSpec>,
}

impl ClassifierSpec {
    pub fn new(classifier: MetaPointer) -> Self {
        Self {
            classifier,
            features: Vec::new(),
        }
    }

    pub fn with(mut self, feature: FeatureSpec) -> Self {
        self.features.push(feature);
        self
    }

    pub fn feature(&self, key: &MetaPointer) -> Option<&FeatureSpec> {
        self.features.iter().find(|f| &f.key == key)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Language {
    classifiers: HashMap<MetaPointer, ClassifierSpec>,
}

impl Language {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, spec: ClassifierSpec) -> Self {
        self.classifiers.insert(spec.classifier.clone(), spec);
        self
    }

    pub fn classifier(&self, classifier: &MetaPointer) -> Option<&ClassifierSpec> {
        self.classifiers.get(classifier)
    }

    /// Check that `feature` exists on `classifier` with the given kind.
    ///
    /// Returns `Ok(None)` for classifiers outside this language.
    pub fn check(
        &self,
        classifier: &MetaPointer,
        feature: &MetaPointer,
        kind: FeatureKind,
    ) -> Result<Option<&FeatureSpec>, ModelError> {
        let spec = match self.classifiers.get(classifier) {
            Some(spec) => spec,
            None => return Ok(None),
        };
        match spec.feature(feature) {
            Some(f) if f.kind == kind => Ok(Some(f)),
            Some(f) => Err(ModelError::FeatureMismatch {
                classifier: classifier.clone(),
                feature: feature.clone(),
                reason: format!("is a {:?}, not a {:?}", f.kind, kind),
            }),
            None => Err(ModelError::FeatureMismatch {
                classifier: classifier.clone(),
                feature: feature.clone(),
                reason: "no such feature".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp(key: &str) -> MetaPointer {
        MetaPointer::new("shapes", "1", key)
    }

    #[test]
    fn test_check_features() {
        let language = Language::new().with(
            ClassifierSpec::new(mp("Circle"))
                .with(FeatureSpec::property(mp("radius")))
                .with(FeatureSpec::single_containment(mp("center"))),
        );

        let center = language
            .check(&mp("Circle"), &mp("center"), FeatureKind::Containment)
            .unwrap()
            .unwrap();
        assert!(!center.multiple);

        assert!(language
            .check(&mp("Circle"), &mp("radius"), FeatureKind::Reference)
            .is_err());
        assert!(language
            .check(&mp("Circle"), &mp("colour"), FeatureKind::Property)
            .is_err());
        assert!(language
            .check(&mp("Square"), &mp("anything"), FeatureKind::Property)
            .unwrap()
            .is_none());
    }
}
