use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::regions::{PreserveRect, RegionDescriptor};
use crate::settings::ChainSettings;

pub const DEFAULT_INSTRUCTION_TEMPLATE: &str = "Replace ONLY the plant foliage inside the {{MARKER_COLOR}} marked area with {{PLANT_NAME}}.

CRITICAL REQUIREMENTS:
- The {{POT_COLOR}} pot MUST remain EXACTLY unchanged
- Same pot color, shape, size, and position
- Do NOT modify anything outside the {{MARKER_COLOR}} ellipse
- Remove the {{MARKER_COLOR}} marker in the final image
- Keep the same lighting and style";

const DEFAULT_POT_COLOR: &str = "ceramic";

/// Which pixels must survive an edit unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    /// Everything outside the edit region.
    #[default]
    OutsideRegion,
    /// Only the declared preserve rectangle.
    PreserveRegion,
}

impl VerificationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutsideRegion => "outside_region",
            Self::PreserveRegion => "preserve_region",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarkerColor {
    #[default]
    Red,
    Blue,
    Yellow,
}

impl MarkerColor {
    pub fn rgb(&self) -> [u8; 3] {
        match self {
            Self::Red => [239, 68, 68],
            Self::Blue => [59, 130, 246],
            Self::Yellow => [234, 179, 8],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Blue => "blue",
            Self::Yellow => "yellow",
        }
    }
}

/// One planned replacement inside the composite photograph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub original: String,
    pub replacement: String,
    /// Path or URL of the replacement subject's reference photo.
    #[serde(default, alias = "plantFile", alias = "reference")]
    pub reference_image: Option<String>,
    #[serde(alias = "foliageMask", alias = "mask", alias = "position")]
    pub region: RegionDescriptor,
    #[serde(default, alias = "potRegion")]
    pub preserve_region: Option<PreserveRect>,
    #[serde(default)]
    pub verification: VerificationMode,
    #[serde(default, alias = "potColor")]
    pub pot_color: Option<String>,
    #[serde(default)]
    pub marker: MarkerColor,
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
}

impl EditSpec {
    pub fn new(
        original: impl Into<String>,
        replacement: impl Into<String>,
        region: RegionDescriptor,
    ) -> Self {
        Self {
            id: None,
            original: original.into(),
            replacement: replacement.into(),
            reference_image: None,
            region,
            preserve_region: None,
            verification: VerificationMode::default(),
            pot_color: None,
            marker: MarkerColor::default(),
            hints: BTreeMap::new(),
        }
    }

    pub fn label(&self) -> String {
        format!("{} → {}", self.original, self.replacement)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.replacement.trim().is_empty() {
            bail!("edit '{}' has no replacement subject", self.original);
        }
        self.region
            .validate()
            .with_context(|| format!("edit '{}' has an invalid region", self.label()))?;
        if let Some(rect) = self.preserve_region.as_ref() {
            rect.validate().with_context(|| {
                format!("edit '{}' has an invalid preserve region", self.label())
            })?;
        }
        if self.verification == VerificationMode::PreserveRegion && self.preserve_region.is_none()
        {
            bail!(
                "edit '{}' verifies a preserve region but declares none",
                self.label()
            );
        }
        Ok(())
    }

    /// Interpolates this edit's labels and hints into an instruction template.
    pub fn render_instruction(&self, template: &str) -> String {
        let pot_color = self
            .pot_color
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_POT_COLOR);
        let mut text = template
            .replace("{{PLANT_NAME}}", &self.replacement)
            .replace("{{ORIGINAL_NAME}}", &self.original)
            .replace("{{POT_COLOR}}", pot_color)
            .replace("{{MARKER_COLOR}}", self.marker.name());
        for (key, value) in &self.hints {
            let placeholder = format!("{{{{{}}}}}", key.trim().to_ascii_uppercase());
            text = text.replace(&placeholder, value);
        }
        text
    }
}

/// A plan file: the source photograph, the ordered edits, and overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditPlan {
    #[serde(default, alias = "imageFile")]
    pub source: Option<String>,
    #[serde(default, alias = "customPrompt", alias = "prompt")]
    pub instruction_template: Option<String>,
    #[serde(default)]
    pub settings: ChainSettings,
    pub edits: Vec<EditSpec>,
}

impl EditPlan {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading plan {}", path.display()))?;
        let plan: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid plan file {}", path.display()))?;
        if plan.edits.is_empty() {
            bail!("plan {} lists no edits", path.display());
        }
        Ok(plan)
    }

    pub fn instruction_template(&self) -> &str {
        self.instruction_template
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(DEFAULT_INSTRUCTION_TEMPLATE)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EditPlan, EditSpec, MarkerColor, VerificationMode, DEFAULT_INSTRUCTION_TEMPLATE};
    use crate::regions::{PreserveRect, RegionDescriptor};

    #[test]
    fn accepts_legacy_field_names() -> anyhow::Result<()> {
        let edit: EditSpec = serde_json::from_value(json!({
            "id": "1",
            "original": "Money Tree",
            "replacement": "Anthurium Red",
            "plantFile": "anthurium-red.jpg",
            "foliageMask": {"cx": 0.15, "cy": 0.70, "rx": 0.05, "ry": 0.07},
            "potRegion": {"x": 0.10, "y": 0.78, "w": 0.10, "h": 0.08},
            "potColor": "cream"
        }))?;
        assert_eq!(edit.reference_image.as_deref(), Some("anthurium-red.jpg"));
        assert_eq!(edit.region, RegionDescriptor::ellipse(0.15, 0.70, 0.05, 0.07));
        assert_eq!(
            edit.preserve_region,
            Some(PreserveRect::new(0.10, 0.78, 0.10, 0.08))
        );
        assert_eq!(edit.verification, VerificationMode::OutsideRegion);
        assert_eq!(edit.marker, MarkerColor::Red);
        Ok(())
    }

    #[test]
    fn renders_placeholders_and_hints() {
        let mut edit = EditSpec::new(
            "Birds Nest Fern",
            "Parlor Palm",
            RegionDescriptor::circle(0.78, 0.66, 0.06),
        );
        edit.pot_color = Some("cream".to_string());
        edit.hints
            .insert("lighting".to_string(), "soft window light".to_string());

        let text = edit.render_instruction(DEFAULT_INSTRUCTION_TEMPLATE);
        assert!(text.contains("with Parlor Palm."));
        assert!(text.contains("The cream pot MUST"));
        assert!(text.contains("outside the red ellipse"));
        assert!(!text.contains("{{"));

        let custom = edit.render_instruction("Swap {{ORIGINAL_NAME}} under {{LIGHTING}}");
        assert_eq!(custom, "Swap Birds Nest Fern under soft window light");
    }

    #[test]
    fn pot_color_defaults_to_ceramic() {
        let edit = EditSpec::new("a", "b", RegionDescriptor::circle(0.5, 0.5, 0.1));
        assert_eq!(edit.render_instruction("{{POT_COLOR}}"), "ceramic");
    }

    #[test]
    fn preserve_mode_requires_rectangle() {
        let mut edit = EditSpec::new("a", "b", RegionDescriptor::circle(0.5, 0.5, 0.1));
        edit.verification = VerificationMode::PreserveRegion;
        assert!(edit.validate().is_err());
        edit.preserve_region = Some(PreserveRect::new(0.4, 0.7, 0.2, 0.1));
        assert!(edit.validate().is_ok());
    }

    #[test]
    fn plan_load_merges_partial_settings() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("plan.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "source": "collection.jpg",
                "settings": {"max_retries": 4, "policy": "halt"},
                "edits": [{
                    "original": "Black ZZ Plant",
                    "replacement": "Calathea",
                    "region": {"cx": 0.38, "cy": 0.58, "rx": 0.08, "ry": 0.12}
                }]
            }))?,
        )?;

        let plan = EditPlan::load(&path)?;
        assert_eq!(plan.settings.max_retries, 4);
        assert_eq!(plan.settings.candidates_per_attempt, 3);
        assert_eq!(plan.instruction_template(), DEFAULT_INSTRUCTION_TEMPLATE);
        assert_eq!(plan.edits.len(), 1);
        Ok(())
    }

    #[test]
    fn plan_without_edits_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("plan.json");
        std::fs::write(&path, r#"{"edits": []}"#)?;
        assert!(EditPlan::load(&path).is_err());
        Ok(())
    }
}
