use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarningKind {
    TabSwitch,
    FocusLoss,
    MultipleFaces,
    NoFace,
    LookingAway,
}

impl WarningKind {
    pub fn default_description(self) -> &'static str {
        match self {
            WarningKind::TabSwitch => "Tab change detected",
            WarningKind::FocusLoss => "Window focus lost",
            WarningKind::MultipleFaces => "Multiple faces detected",
            WarningKind::NoFace => "No face detected",
            WarningKind::LookingAway => "Looking away from screen",
        }
    }
}

/// One recorded integrity violation. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    #[serde(rename = "type")]
    pub kind: WarningKind,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

impl Warning {
    pub fn new(kind: WarningKind, description: Option<&str>) -> Self {
        let description = description
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| kind.default_description());

        Self {
            kind,
            timestamp: Utc::now(),
            description: description.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let warning = Warning::new(WarningKind::TabSwitch, None);
        let json = serde_json::to_value(&warning).unwrap();

        assert_eq!(json["type"], "tab-switch");
        assert_eq!(json["description"], "Tab change detected");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_blank_description_falls_back() {
        let warning = Warning::new(WarningKind::NoFace, Some("  "));
        assert_eq!(warning.description, "No face detected");

        let custom = Warning::new(WarningKind::NoFace, Some("Camera access failed"));
        assert_eq!(custom.description, "Camera access failed");
    }

    #[test]
    fn test_parses_looking_away() {
        let kind: WarningKind = serde_json::from_str("\"looking-away\"").unwrap();
        assert_eq!(kind, WarningKind::LookingAway);
    }
}
