use std::path::Path;

use anyhow::Context;
use opmirror_core::StageCodeTable;
use serde::{Deserialize, Serialize};

use crate::probe::ColumnRule;

const BUILTIN_SCHEMA_RULES: &str = include_str!("../../../rules/schema.yaml");
pub const SCHEMA_RULES_FILE: &str = "schema.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRules {
    pub routing: RoutingRules,
    pub lookups: LookupRules,
    #[serde(default)]
    pub stage_codes: StageCodeTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRules {
    /// Candidate routing tables, most likely first.
    pub tables: Vec<String>,
    pub columns: RoutingColumnRules,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingColumnRules {
    pub order_link: ColumnRule,
    pub stage: ColumnRule,
    pub sequence: ColumnRule,
    #[serde(default)]
    pub started_at: ColumnRule,
    #[serde(default)]
    pub finished_at: ColumnRule,
    #[serde(default)]
    pub status: ColumnRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupRules {
    pub product_description: ColumnRule,
    pub color_name: ColumnRule,
    #[serde(default)]
    pub header_color: ColumnRule,
}

impl SchemaRules {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let rules: Self = serde_yaml::from_str(raw).context("parsing schema rules")?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_yaml_str(BUILTIN_SCHEMA_RULES).context("built-in rules/schema.yaml")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    /// `<rules_dir>/schema.yaml` when present, otherwise the built-in copy.
    pub fn load_or_builtin(rules_dir: &Path) -> anyhow::Result<Self> {
        let path = rules_dir.join(SCHEMA_RULES_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::debug!(path = %path.display(), "no schema rules on disk, using built-in copy");
            Self::builtin()
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.routing.tables.is_empty() {
            anyhow::bail!("routing.tables must list at least one candidate table");
        }
        let columns = &self.routing.columns;
        for (role, rule) in [
            ("routing.columns.order_link", &columns.order_link),
            ("routing.columns.stage", &columns.stage),
            ("routing.columns.sequence", &columns.sequence),
            ("routing.columns.started_at", &columns.started_at),
            ("routing.columns.finished_at", &columns.finished_at),
            ("routing.columns.status", &columns.status),
            ("lookups.product_description", &self.lookups.product_description),
            ("lookups.color_name", &self.lookups.color_name),
            ("lookups.header_color", &self.lookups.header_color),
        ] {
            rule.compile().with_context(|| format!("rule {role}"))?;
        }
        Ok(())
    }
}
