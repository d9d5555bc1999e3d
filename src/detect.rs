//! The detection collaborator contract, consumed once at pipeline start to
//! seed the context with language/framework/test-runner information.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::settings::Settings;

/// Detected (or operator-configured) project facts. Empty values mean
/// "unknown" and are fine: agents work without them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub language: Option<String>,
    pub framework: Option<String>,
    pub test_runner: Option<String>,
    pub test_command: Option<String>,
}

pub trait ProjectDetector: Send + Sync {
    fn detect(&self, project_path: &Path) -> ProjectInfo;
}

/// Surfaces whatever the operator configured in `levelup.yaml`; everything
/// else stays unknown.
pub struct SettingsDetector {
    info: ProjectInfo,
}

impl SettingsDetector {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            info: ProjectInfo {
                language: settings.project.language.clone(),
                framework: settings.project.framework.clone(),
                test_runner: None,
                test_command: settings.project.test_command.clone(),
            },
        }
    }
}

impl ProjectDetector for SettingsDetector {
    fn detect(&self, _project_path: &Path) -> ProjectInfo {
        self.info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ProjectSettings;

    #[test]
    fn settings_detector_surfaces_configured_values() {
        let settings = Settings {
            project: ProjectSettings {
                path: None,
                language: Some("python".into()),
                framework: Some("django".into()),
                test_command: Some("pytest".into()),
            },
            ..Default::default()
        };
        let detector = SettingsDetector::from_settings(&settings);
        let info = detector.detect(Path::new("/anywhere"));
        assert_eq!(info.language.as_deref(), Some("python"));
        assert_eq!(info.framework.as_deref(), Some("django"));
        assert_eq!(info.test_runner, None);
        assert_eq!(info.test_command.as_deref(), Some("pytest"));
    }

    #[test]
    fn defaults_detect_nothing() {
        let detector = SettingsDetector::from_settings(&Settings::default());
        assert_eq!(detector.detect(Path::new("/p")), ProjectInfo::default());
    }
}
