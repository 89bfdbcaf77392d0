//! The declarative, immutable-after-load part specification (§3, §6).
//!
//! `PartSpec` is the direct Rust rendition of one entry under the `parts:`
//! key of the parts YAML schema. Every field is optional except `plugin`;
//! defaults are empty collections / `None`, matching the original's
//! "all fields optional except plugin" rule.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::steps::Step;

/// An ordered source-glob -> destination-path mapping, preserving the
/// declaration order from the YAML document (a plain `BTreeMap` would
/// silently re-sort it, which would change layer-hash-adjacent semantics
/// nothing relies on today but which the spec calls out as "ordered").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrganizeMap(pub Vec<(String, String)>);

impl OrganizeMap {
    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for OrganizeMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for OrganizeMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrganizeVisitor;

        impl<'de> Visitor<'de> for OrganizeVisitor {
            type Value = OrganizeMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping from source glob to destination path")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((k, v)) = map.next_entry::<String, String>()? {
                    entries.push((k, v));
                }
                Ok(OrganizeMap(entries))
            }
        }

        deserializer.deserialize_map(OrganizeVisitor)
    }
}

/// The declarative, immutable spec of a single part, as loaded from the
/// `parts:` section of the project YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartSpec {
    pub plugin: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "source-type", default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,

    #[serde(rename = "build-packages", default)]
    pub build_packages: Vec<String>,
    #[serde(rename = "build-snaps", default)]
    pub build_snaps: Vec<String>,
    #[serde(rename = "stage-packages", default)]
    pub stage_packages: Vec<String>,
    #[serde(rename = "stage-snaps", default)]
    pub stage_snaps: Vec<String>,

    #[serde(rename = "overlay-packages", default)]
    pub overlay_packages: Vec<String>,
    #[serde(rename = "overlay-files", default)]
    pub overlay_files: Vec<String>,
    #[serde(rename = "overlay-script", default, skip_serializing_if = "Option::is_none")]
    pub overlay_script: Option<String>,

    #[serde(rename = "override-pull", default, skip_serializing_if = "Option::is_none")]
    pub override_pull: Option<String>,
    #[serde(rename = "override-build", default, skip_serializing_if = "Option::is_none")]
    pub override_build: Option<String>,
    #[serde(rename = "override-stage", default, skip_serializing_if = "Option::is_none")]
    pub override_stage: Option<String>,
    #[serde(rename = "override-prime", default, skip_serializing_if = "Option::is_none")]
    pub override_prime: Option<String>,

    #[serde(default)]
    pub organize: OrganizeMap,

    #[serde(default)]
    pub after: Vec<String>,

    /// Plugin-specific keys not modeled by this struct, captured verbatim so
    /// round-tripping the YAML doesn't lose information the plugin needs.
    #[serde(flatten)]
    pub plugin_properties: BTreeMap<String, serde_yaml::Value>,
}

impl PartSpec {
    /// A minimal spec for a part with no build step (`plugin: nil`), as used
    /// throughout the §8 scenario tests.
    pub fn nil(source: Option<&str>) -> Self {
        PartSpec {
            plugin: "nil".to_string(),
            source: source.map(str::to_string),
            source_type: None,
            build_packages: Vec::new(),
            build_snaps: Vec::new(),
            stage_packages: Vec::new(),
            stage_snaps: Vec::new(),
            overlay_packages: Vec::new(),
            overlay_files: Vec::new(),
            overlay_script: None,
            override_pull: None,
            override_build: None,
            override_stage: None,
            override_prime: None,
            organize: OrganizeMap::default(),
            after: Vec::new(),
            plugin_properties: BTreeMap::new(),
        }
    }

    /// Returns the scriptlet text for the override associated with `step`,
    /// if the part declares one.
    pub fn scriptlet(&self, step: Step) -> Option<&str> {
        match step {
            Step::Pull => self.override_pull.as_deref(),
            Step::Overlay => None, // overlay's scriptlet is `overlay_script`, not an override-*
            Step::Build => self.override_build.as_deref(),
            Step::Stage => self.override_stage.as_deref(),
            Step::Prime => self.override_prime.as_deref(),
        }
    }

    /// Serialize this spec to the JSON value embedded as `part-properties` in
    /// a persisted `StepState` ("the marshalled spec at time of run").
    pub fn marshal(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("PartSpec always serializes")
    }

    pub fn has_overlay(&self) -> bool {
        !self.overlay_packages.is_empty()
            || !self.overlay_files.is_empty()
            || self.overlay_script.is_some()
    }
}

/// An ordered part-name -> spec mapping. Declaration order matters here the
/// same way it does for `OrganizeMap`: §4.3 step 1 breaks topological-sort
/// ties "by declaration order", which a `BTreeMap` would silently discard by
/// re-sorting part names alphabetically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartsMap(pub Vec<(String, PartSpec)>);

impl PartsMap {
    pub fn get(&self, name: &str) -> Option<&PartSpec> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, PartSpec)> {
        self.0.iter()
    }
}

impl IntoIterator for PartsMap {
    type Item = (String, PartSpec);
    type IntoIter = std::vec::IntoIter<(String, PartSpec)>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Serialize for PartsMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PartsMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PartsVisitor;

        impl<'de> Visitor<'de> for PartsVisitor {
            type Value = PartsMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping from part name to part spec")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((k, v)) = map.next_entry::<String, PartSpec>()? {
                    entries.push((k, v));
                }
                Ok(PartsMap(entries))
            }
        }

        deserializer.deserialize_map(PartsVisitor)
    }
}

/// Top level `parts:` document (§6 parts YAML schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartsDocument {
    pub parts: PartsMap,
}

impl PartsDocument {
    pub fn from_yaml(yaml: &str) -> Result<Self, crate::errors::PartsError> {
        serde_yaml::from_str(yaml).map_err(|e| crate::errors::PartsError::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_nil_part() {
        let doc = PartsDocument::from_yaml(
            "parts:\n  p1:\n    plugin: nil\n    source: .\n",
        )
        .unwrap();
        let p1 = doc.parts.get("p1").unwrap();
        assert_eq!(p1.plugin, "nil");
        assert_eq!(p1.source.as_deref(), Some("."));
        assert!(p1.build_packages.is_empty());
    }

    #[test]
    fn organize_preserves_declaration_order() {
        let doc = PartsDocument::from_yaml(
            "parts:\n  p1:\n    plugin: nil\n    organize:\n      b: /b\n      a: /a\n",
        )
        .unwrap();
        let organize = &doc.parts.get("p1").unwrap().organize;
        assert_eq!(
            organize.0,
            vec![("b".to_string(), "/b".to_string()), ("a".to_string(), "/a".to_string())]
        );
    }

    #[test]
    fn plugin_specific_keys_are_captured() {
        let doc = PartsDocument::from_yaml(
            "parts:\n  p1:\n    plugin: cmake\n    cmake-parameters:\n      - -DFOO=bar\n",
        )
        .unwrap();
        assert!(doc.parts.get("p1").unwrap().plugin_properties.contains_key("cmake-parameters"));
    }

    #[test]
    fn scriptlet_returns_override_for_requested_step() {
        let mut spec = PartSpec::nil(None);
        spec.override_build = Some("make".to_string());
        assert_eq!(spec.scriptlet(Step::Build), Some("make"));
        assert_eq!(spec.scriptlet(Step::Stage), None);
    }
}
