//! Correction definitions.
//!
//! Every correction name is bound to one [`TemporalKind`] and a fixed set
//! of index labels. Writes are checked against the definition before any
//! mutation policy runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::{
    CorrectionRecord, Label, Labels, TemporalKind, KEY_SEPARATORS, RESERVED_FIELDS,
};
use crate::{CorrectionError, Result};

/// One index label of a correction, optionally with a default value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Label>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionSchema {
    pub name: String,
    pub kind: TemporalKind,
    #[serde(default)]
    pub labels: Vec<LabelSpec>,
}

impl CorrectionSchema {
    /// A sample-based (interpolating) correction.
    pub fn instant(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TemporalKind::Instant,
            labels: Vec::new(),
        }
    }

    /// An interval-based correction.
    pub fn interval(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TemporalKind::Interval,
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, name: impl Into<String>) -> Self {
        self.labels.push(LabelSpec {
            name: name.into(),
            default: None,
        });
        self
    }

    pub fn with_default_label(mut self, name: impl Into<String>, default: impl Into<Label>) -> Self {
        self.labels.push(LabelSpec {
            name: name.into(),
            default: Some(default.into()),
        });
        self
    }

    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|l| l.name.as_str())
    }

    /// Fill in defaulted labels that `labels` does not set.
    pub fn apply_defaults(&self, labels: &mut Labels) {
        for spec in &self.labels {
            if let Some(default) = &spec.default {
                labels
                    .entry(spec.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
    }

    /// Check a record (with defaults already applied) against the definition.
    pub fn validate(&self, record: &CorrectionRecord) -> Result<()> {
        if record.correction_name != self.name {
            return Err(CorrectionError::InvalidRecord(format!(
                "record for `{}` checked against schema `{}`",
                record.correction_name, self.name
            )));
        }
        if record.version.is_empty() {
            return Err(CorrectionError::InvalidRecord(format!(
                "`{}` record has an empty version",
                self.name
            )));
        }
        check_key_component("version", &record.version)?;
        for (name, label) in &record.labels {
            if let Label::Text(text) = label {
                check_key_component(&format!("label `{name}`"), text)?;
            }
        }
        if !record.value.is_finite() {
            return Err(CorrectionError::InvalidRecord(format!(
                "`{}` value {} is not finite",
                self.name, record.value
            )));
        }
        if record.time.kind() != self.kind {
            return Err(CorrectionError::InvalidRecord(format!(
                "`{}` is an {} correction, got an {} key",
                self.name,
                self.kind,
                record.time.kind()
            )));
        }
        for name in self.label_names() {
            if !record.labels.contains_key(name) {
                return Err(CorrectionError::InvalidRecord(format!(
                    "`{}` record is missing label `{name}`",
                    self.name
                )));
            }
        }
        for name in record.labels.keys() {
            if !self.label_names().any(|n| n == name.as_str()) {
                return Err(CorrectionError::InvalidRecord(format!(
                    "`{}` has no label `{name}`",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Reject label filters that name labels the correction does not have.
    pub fn validate_filter(&self, labels: &Labels) -> Result<()> {
        match labels
            .keys()
            .find(|name| !self.label_names().any(|n| n == name.as_str()))
        {
            Some(name) => Err(CorrectionError::InvalidRecord(format!(
                "`{}` has no label `{name}`",
                self.name
            ))),
            None => Ok(()),
        }
    }
}

fn check_key_component(what: &str, value: &str) -> Result<()> {
    match value.chars().find(|c| KEY_SEPARATORS.contains(c)) {
        Some(c) => Err(CorrectionError::InvalidRecord(format!(
            "{what} `{value}` contains the key separator `{c}`"
        ))),
        None => Ok(()),
    }
}

/// Every correction the store knows about, by name.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, CorrectionSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The detector corrections shipped with the store.
    pub fn builtin() -> Self {
        let builtin = [
            CorrectionSchema::instant("pmt_gains")
                .with_label("detector")
                .with_label("pmt"),
            CorrectionSchema::instant("hit_thresholds")
                .with_label("detector")
                .with_label("pmt"),
            CorrectionSchema::instant("pmt_area_to_pes")
                .with_label("detector")
                .with_label("pmt"),
            CorrectionSchema::instant("se_gain").with_default_label("partition", "all_tpc"),
            CorrectionSchema::instant("avg_se_gain").with_default_label("partition", "all_tpc"),
            CorrectionSchema::instant("electron_diffusion_cte"),
            CorrectionSchema::instant("relative_light_yield"),
            CorrectionSchema::interval("global_versions").with_label("config_name"),
            CorrectionSchema::interval("hotspot_vetos"),
            CorrectionSchema::interval("s1_aft_xyz_maps"),
            CorrectionSchema::interval("z_bias_map"),
        ];
        Self {
            schemas: builtin
                .into_iter()
                .map(|schema| (schema.name.clone(), schema))
                .collect(),
        }
    }

    pub fn register(&mut self, schema: CorrectionSchema) -> Result<()> {
        if schema.name.is_empty() {
            return Err(CorrectionError::InvalidRecord(
                "correction name must not be empty".into(),
            ));
        }
        check_key_component("correction name", &schema.name)?;
        if self.schemas.contains_key(&schema.name) {
            return Err(CorrectionError::InvalidRecord(format!(
                "correction `{}` is already registered",
                schema.name
            )));
        }
        for (i, label) in schema.labels.iter().enumerate() {
            check_key_component("label name", &label.name)?;
            if RESERVED_FIELDS.contains(&label.name.as_str()) {
                return Err(CorrectionError::InvalidRecord(format!(
                    "`{}` cannot be used as a label of `{}`",
                    label.name, schema.name
                )));
            }
            if schema.labels[..i].iter().any(|l| l.name == label.name) {
                return Err(CorrectionError::InvalidRecord(format!(
                    "label `{}` declared twice on `{}`",
                    label.name, schema.name
                )));
            }
        }
        self.schemas.insert(schema.name.clone(), schema);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&CorrectionSchema> {
        self.schemas
            .get(name)
            .ok_or_else(|| CorrectionError::InvalidRecord(format!("unknown correction `{name}`")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn builtin_registry_knows_both_kinds() {
        let registry = SchemaRegistry::builtin();
        assert_eq!(registry.get("pmt_gains").unwrap().kind, TemporalKind::Instant);
        assert_eq!(
            registry.get("global_versions").unwrap().kind,
            TemporalKind::Interval
        );
        assert!(matches!(
            registry.get("no_such_correction"),
            Err(CorrectionError::InvalidRecord(_))
        ));
    }

    #[test]
    fn builtin_schemas_pass_registration_checks() {
        let builtin = SchemaRegistry::builtin();
        let mut fresh = SchemaRegistry::new();
        for name in builtin.names() {
            fresh.register(builtin.get(name).unwrap().clone()).unwrap();
        }
    }

    #[test]
    fn key_separators_are_rejected() {
        let schema = CorrectionSchema::interval("global_versions").with_label("config_name");
        let t = dt("2024-01-01T00:00:00Z");
        let right = dt("2024-02-01T00:00:00Z");
        let record = |version: &str, config: &str| {
            CorrectionRecord::interval("global_versions", version, t, right, 1.0)
                .unwrap()
                .with_label("config_name", config)
        };

        schema.validate(&record("v1", "a")).unwrap();
        for bad in [
            record("v1:config_name=a", "b"),
            record("v1", "a:config_name=b"),
            record("v1", "a,b"),
        ] {
            assert!(matches!(
                schema.validate(&bad),
                Err(CorrectionError::InvalidRecord(_))
            ));
        }

        let mut registry = SchemaRegistry::new();
        assert!(registry.register(CorrectionSchema::instant("a:b")).is_err());
        assert!(registry
            .register(CorrectionSchema::instant("c").with_label("x=y"))
            .is_err());
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let schema = CorrectionSchema::instant("relative_light_yield");
        let t = dt("2024-01-01T00:00:00Z");
        for value in [f64::NAN, f64::INFINITY] {
            let record = CorrectionRecord::sample("relative_light_yield", "v1", t, value);
            assert!(matches!(
                schema.validate(&record),
                Err(CorrectionError::InvalidRecord(_))
            ));
        }
        let vector = CorrectionRecord::sample("relative_light_yield", "v1", t, vec![1.0, f64::NAN]);
        assert!(schema.validate(&vector).is_err());
    }

    #[test]
    fn defaults_fill_missing_labels_only() {
        let schema = CorrectionSchema::instant("se_gain").with_default_label("partition", "all_tpc");
        let mut labels = Labels::new();
        schema.apply_defaults(&mut labels);
        assert_eq!(labels["partition"], Label::from("all_tpc"));

        let mut labels = Labels::from([("partition".to_string(), Label::from("ab"))]);
        schema.apply_defaults(&mut labels);
        assert_eq!(labels["partition"], Label::from("ab"));
    }

    #[test]
    fn validate_checks_kind_and_labels() {
        let schema = CorrectionSchema::instant("pmt_gains")
            .with_label("detector")
            .with_label("pmt");
        let t = dt("2024-01-01T00:00:00Z");

        let ok = CorrectionRecord::sample("pmt_gains", "v1", t, 1.0)
            .with_label("detector", "tpc")
            .with_label("pmt", 3);
        schema.validate(&ok).unwrap();

        let missing = CorrectionRecord::sample("pmt_gains", "v1", t, 1.0).with_label("pmt", 3);
        assert!(schema.validate(&missing).is_err());

        let extra = ok.clone().with_label("channel", 7);
        assert!(schema.validate(&extra).is_err());

        let wrong_kind = CorrectionRecord::interval(
            "pmt_gains",
            "v1",
            t,
            dt("2024-02-01T00:00:00Z"),
            1.0,
        )
        .unwrap()
        .with_label("detector", "tpc")
        .with_label("pmt", 3);
        assert!(schema.validate(&wrong_kind).is_err());
    }

    #[test]
    fn reserved_and_duplicate_labels_are_rejected() {
        let mut registry = SchemaRegistry::new();
        assert!(registry
            .register(CorrectionSchema::instant("a").with_label("time"))
            .is_err());
        assert!(registry
            .register(CorrectionSchema::instant("b").with_label("pmt").with_label("pmt"))
            .is_err());
        registry.register(CorrectionSchema::instant("c")).unwrap();
        assert!(registry.register(CorrectionSchema::interval("c")).is_err());
    }

    #[test]
    fn schema_round_trips_through_json() {
        let raw = r#"{"name":"se_gain","kind":"instant","labels":[{"name":"partition","default":"all_tpc"}]}"#;
        let schema: CorrectionSchema = serde_json::from_str(raw).unwrap();
        assert_eq!(schema.kind, TemporalKind::Instant);
        assert_eq!(schema.labels[0].default, Some(Label::from("all_tpc")));
    }
}
