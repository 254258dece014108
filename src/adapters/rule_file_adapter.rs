//! INI rule store. Each `[rule:<id>]` section is one rule:
//!
//! ```ini
//! [rule:ttf-spike]
//! instrument = TTF
//! type = z_score
//! severity = high
//! threshold = 3
//! lookback = 20
//! ```
//!
//! `instrument` (or `instrument_id`), `type`, `name`, `severity` and
//! `enabled` are rule fields; every other key is a type-specific parameter.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use configparser::ini::Ini;

use crate::domain::error::QcwatchError;
use crate::domain::rule::{RuleDefinition, Severity};
use crate::ports::rule_port::RulePort;

const SECTION_PREFIX: &str = "rule:";

pub struct RuleFileAdapter {
    rules: Vec<RuleDefinition>,
}

impl RuleFileAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, QcwatchError> {
        let path = path.as_ref();
        let mut ini = Ini::new_cs();
        let map = ini.load(path).map_err(|reason| QcwatchError::ConfigParse {
            file: path.display().to_string(),
            reason,
        })?;
        Ok(Self {
            rules: Self::parse_sections(map),
        })
    }

    pub fn from_string(content: &str) -> Result<Self, QcwatchError> {
        let mut ini = Ini::new_cs();
        let map = ini
            .read(content.to_string())
            .map_err(|reason| QcwatchError::ConfigParse {
                file: "<string>".to_string(),
                reason,
            })?;
        Ok(Self {
            rules: Self::parse_sections(map),
        })
    }

    fn parse_sections(map: HashMap<String, HashMap<String, Option<String>>>) -> Vec<RuleDefinition> {
        let mut rules: Vec<RuleDefinition> = map
            .into_iter()
            .filter_map(|(section, entries)| {
                let id = section.strip_prefix(SECTION_PREFIX)?.trim().to_string();
                Some(Self::definition(id, entries))
            })
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    fn definition(id: String, entries: HashMap<String, Option<String>>) -> RuleDefinition {
        let mut def = RuleDefinition {
            name: id.clone(),
            id,
            instrument_id: String::new(),
            rule_type: String::new(),
            parameters: BTreeMap::new(),
            severity: Severity::default().to_string(),
            enabled: true,
        };

        for (key, value) in entries {
            let value = value.unwrap_or_default().trim().to_string();
            match key.trim().to_lowercase().as_str() {
                "instrument" | "instrument_id" => def.instrument_id = value,
                "type" | "rule_type" => def.rule_type = value,
                "name" => def.name = value,
                "severity" => def.severity = value,
                "enabled" => def.enabled = !matches!(
                    value.to_lowercase().as_str(),
                    "false" | "no" | "0" | "off"
                ),
                other => {
                    def.parameters.insert(other.to_string(), value);
                }
            }
        }
        def
    }
}

impl RulePort for RuleFileAdapter {
    fn list_enabled_rules(&self) -> Result<Vec<RuleDefinition>, QcwatchError> {
        Ok(self.rules.iter().filter(|r| r.enabled).cloned().collect())
    }

    fn list_rules(&self) -> Result<Vec<RuleDefinition>, QcwatchError> {
        Ok(self.rules.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rule::{AlertRule, RuleType};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const RULES: &str = r#"
[rule:TTF-spike]
instrument = TTF
type = zscore
severity = high
threshold = 3
lookback = 20

[rule:ttf-custom]
instrument_id = TTF
type = custom_expression
expression = price >= threshold and latest_outlier == 0
threshold = 40

[rule:old]
instrument = NBP
type = staleness
threshold = 5
enabled = no

[settings]
ignored = yes
"#;

    #[test]
    fn sections_become_definitions() {
        let adapter = RuleFileAdapter::from_string(RULES).unwrap();
        let all = adapter.list_rules().unwrap();
        assert_eq!(
            all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["TTF-spike", "old", "ttf-custom"]
        );

        let spike = &all[0];
        assert_eq!(spike.instrument_id, "TTF");
        assert_eq!(spike.severity, "high");
        assert_eq!(spike.parameters.get("threshold").map(String::as_str), Some("3"));
        assert!(!spike.parameters.contains_key("type"));
    }

    #[test]
    fn disabled_rules_are_filtered() {
        let adapter = RuleFileAdapter::from_string(RULES).unwrap();
        let enabled = adapter.list_enabled_rules().unwrap();
        assert_eq!(enabled.len(), 2);
        assert!(enabled.iter().all(|r| r.id != "old"));
    }

    #[test]
    fn expression_survives_ini_parsing() {
        let adapter = RuleFileAdapter::from_string(RULES).unwrap();
        let custom = adapter
            .list_rules()
            .unwrap()
            .into_iter()
            .find(|r| r.id == "ttf-custom")
            .unwrap();
        let rule = AlertRule::from_definition(&custom).unwrap();
        assert_eq!(rule.rule_type(), RuleType::CustomExpression);
    }

    #[test]
    fn from_file_reads_rules() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", RULES).unwrap();
        let adapter = RuleFileAdapter::from_file(file.path()).unwrap();
        assert_eq!(adapter.list_rules().unwrap().len(), 3);
    }

    #[test]
    fn missing_file_is_config_error() {
        assert!(matches!(
            RuleFileAdapter::from_file("/nonexistent/rules.ini"),
            Err(QcwatchError::ConfigParse { .. })
        ));
    }
}
