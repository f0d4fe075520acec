use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Fr,
    En,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Fr => "fr",
            Language::En => "en",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fr" | "french" | "francais" | "français" => Ok(Language::Fr),
            "en" | "english" => Ok(Language::En),
            other => Err(anyhow!("unsupported language: {other} (expected fr or en)")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Theme {
    #[default]
    BlueNight,
    Anthracite,
}

impl Theme {
    pub fn as_str(self) -> &'static str {
        match self {
            Theme::BlueNight => "blue-night",
            Theme::Anthracite => "anthracite",
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Theme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blue-night" | "bluenight" | "blue" => Ok(Theme::BlueNight),
            "anthracite" | "grey" | "gray" => Ok(Theme::Anthracite),
            other => Err(anyhow!(
                "unsupported theme: {other} (expected blue-night or anthracite)"
            )),
        }
    }
}

/// Per-client display preferences, stored under the `appSettings` key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub theme: Theme,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_french_blue_night() {
        let settings = AppSettings::default();
        assert_eq!(settings.language, Language::Fr);
        assert_eq!(settings.theme, Theme::BlueNight);
    }

    #[test]
    fn stored_json_uses_short_names() {
        let json = serde_json::to_string(&AppSettings {
            language: Language::En,
            theme: Theme::Anthracite,
        })
        .expect("serialize");
        assert_eq!(json, r#"{"language":"en","theme":"anthracite"}"#);

        let partial: AppSettings = serde_json::from_str(r#"{"theme":"blue-night"}"#).expect("parse");
        assert_eq!(partial.language, Language::Fr);
    }

    #[test]
    fn parses_cli_spellings() {
        assert_eq!("EN".parse::<Language>().expect("lang"), Language::En);
        assert_eq!("blue".parse::<Theme>().expect("theme"), Theme::BlueNight);
        assert!("de".parse::<Language>().is_err());
    }
}
