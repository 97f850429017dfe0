//! Classifier policy data.
//!
//! Thresholds and marker lists are tuned against observed false positives, so
//! they live outside the control flow and can be swapped from a rules file.
//! Every rule set carries a version and a content fingerprint that is
//! recorded with each run summary.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Version tag of the built-in rule set.
pub const DEFAULT_RULES_VERSION: &str = "builtin-2";

#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("failed to read rules file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse rules file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid rules: {0}")]
    Invalid(String),
}

/// Swappable classifier thresholds and signatures.
///
/// Marker lists are matched case-insensitively as substrings of the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierRules {
    pub version: String,
    /// Pages below this many words may be thin.
    pub min_words: usize,
    /// Link density at or above which a short page is navigation-only.
    pub max_link_density: f64,
    /// Word count that counts as real content even when challenge markers appear.
    pub real_content_min_words: usize,
    /// Short pages larger than this (bytes) are thin even without a density estimate.
    pub thin_min_html_bytes: usize,
    pub challenge_markers: Vec<String>,
    pub soft_block_markers: Vec<String>,
    /// Deny-page phrases that, with a blocking status, mean a hard block.
    pub hard_block_markers: Vec<String>,
    /// Vendor name -> body signatures of that vendor's block pages.
    pub waf_signatures: BTreeMap<String, Vec<String>>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ClassifierRules {
    fn default() -> Self {
        let mut waf_signatures = BTreeMap::new();
        waf_signatures.insert(
            "cloudflare".to_string(),
            strings(&["cloudflare ray id", "cf-error-details", "attention required! | cloudflare"]),
        );
        waf_signatures.insert(
            "incapsula".to_string(),
            strings(&["incapsula", "_incapsula_resource", "imperva"]),
        );
        waf_signatures.insert(
            "akamai".to_string(),
            strings(&["akamaighost", "reference&#32;&#35;", "akamai reference"]),
        );
        waf_signatures.insert(
            "sucuri".to_string(),
            strings(&["sucuri website firewall", "sucuri cloudproxy"]),
        );
        waf_signatures.insert(
            "perimeterx".to_string(),
            strings(&["perimeterx", "px-captcha", "_pxhd"]),
        );
        waf_signatures.insert(
            "datadome".to_string(),
            strings(&["datadome", "captcha-delivery.com"]),
        );
        waf_signatures.insert("aws_waf".to_string(), strings(&["awswaf", "aws-waf-token"]));

        Self {
            version: DEFAULT_RULES_VERSION.to_string(),
            min_words: 50,
            max_link_density: 0.4,
            real_content_min_words: 150,
            thin_min_html_bytes: 5000,
            challenge_markers: strings(&[
                "checking your browser",
                "checking the site connection security",
                "just a moment",
                "cf-browser-verification",
                "verify you are human",
                "verifying you are human",
                "one more step",
                "captcha",
                "sg-captcha",
                "challenge-platform",
            ]),
            soft_block_markers: strings(&[
                "your request has been blocked",
                "request has been blocked",
                "request blocked",
                "sorry, you have been blocked",
                "access denied",
                "forbidden",
                "unusual traffic",
                "automated process",
                "security check",
                "bot detected",
            ]),
            hard_block_markers: strings(&[
                "access denied",
                "you have been blocked",
                "request blocked",
                "forbidden",
                "incident id",
                "error reference number",
                "request unsuccessful",
                "your ip has been banned",
            ]),
            waf_signatures,
        }
    }
}

impl ClassifierRules {
    /// Load rules from a TOML, YAML or JSON file, picked by extension.
    ///
    /// Fields missing from the file keep their built-in defaults.
    pub fn load(path: &Path) -> Result<Self, RulesError> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| RulesError::Read {
            path: display.clone(),
            source,
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let parsed: Result<Self, String> = match ext {
            "toml" => toml::from_str(&contents).map_err(|e| e.to_string()),
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| e.to_string()),
            _ => serde_json::from_str(&contents).map_err(|e| e.to_string()),
        };
        let rules = parsed.map_err(|message| RulesError::Parse {
            path: display,
            message,
        })?;

        rules.validate()?;
        Ok(rules.normalized())
    }

    /// Load from `path` when it exists, otherwise use the built-in rules.
    pub fn load_or_default(path: &Path) -> Result<Self, RulesError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<(), RulesError> {
        if !(0.0..=1.0).contains(&self.max_link_density) {
            return Err(RulesError::Invalid(format!(
                "max_link_density must be within [0, 1], got {}",
                self.max_link_density
            )));
        }
        Ok(())
    }

    /// Lowercase every marker so matching can compare against a lowercased body.
    fn normalized(mut self) -> Self {
        let lower = |list: &mut Vec<String>| {
            for item in list.iter_mut() {
                *item = item.to_lowercase();
            }
        };
        lower(&mut self.challenge_markers);
        lower(&mut self.soft_block_markers);
        lower(&mut self.hard_block_markers);
        for signatures in self.waf_signatures.values_mut() {
            lower(signatures);
        }
        self
    }

    /// SHA-256 of the serialized rule set, hex encoded.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// First WAF vendor whose signature appears in `lower_body`, with the
    /// matching signature.
    pub fn waf_from_body(&self, lower_body: &str) -> Option<(&str, &str)> {
        self.waf_signatures.iter().find_map(|(vendor, signatures)| {
            signatures
                .iter()
                .find(|s| lower_body.contains(s.as_str()))
                .map(|s| (vendor.as_str(), s.as_str()))
        })
    }
}

/// Markers from `markers` found in `lower_body`, in list order.
pub fn marker_hits(lower_body: &str, markers: &[String]) -> Vec<String> {
    markers
        .iter()
        .filter(|m| lower_body.contains(m.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_thresholds() {
        let rules = ClassifierRules::default();
        assert_eq!(rules.min_words, 50);
        assert_eq!(rules.max_link_density, 0.4);
        assert_eq!(rules.real_content_min_words, 150);
        assert_eq!(rules.version, DEFAULT_RULES_VERSION);
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let a = ClassifierRules::default();
        let mut b = ClassifierRules::default();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        b.min_words = 80;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_load_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "version = \"tuned-1\"").unwrap();
        writeln!(file, "min_words = 80").unwrap();
        writeln!(file, "soft_block_markers = [\"Please Stand By\"]").unwrap();

        let rules = ClassifierRules::load(&path).unwrap();
        assert_eq!(rules.version, "tuned-1");
        assert_eq!(rules.min_words, 80);
        assert_eq!(rules.soft_block_markers, vec!["please stand by".to_string()]);
        assert_eq!(rules.max_link_density, 0.4);
        assert!(!rules.challenge_markers.is_empty());
    }

    #[test]
    fn test_load_rejects_bad_density() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"{"max_link_density": 3.0}"#).unwrap();
        assert!(matches!(
            ClassifierRules::load(&path),
            Err(RulesError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let rules = ClassifierRules::load_or_default(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(rules, ClassifierRules::default());
    }

    #[test]
    fn test_waf_from_body() {
        let rules = ClassifierRules::default();
        assert_eq!(
            rules.waf_from_body("access denied - incapsula incident id"),
            Some(("incapsula", "incapsula"))
        );
        assert_eq!(rules.waf_from_body("welcome to our careers page"), None);
    }
}
