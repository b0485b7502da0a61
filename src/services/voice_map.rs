use crate::core::state::Role;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const NEUTRAL_VOICE: &str = "neutral";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VoiceStyleEntry {
    pub style: String,
    pub voice_id: String,
}

impl VoiceStyleEntry {
    fn new(style: &str, voice_id: &str) -> Self {
        Self {
            style: style.to_string(),
            voice_id: voice_id.to_string(),
        }
    }
}

pub fn default_voice_styles() -> Vec<VoiceStyleEntry> {
    vec![
        VoiceStyleEntry::new("中性声线", "neutral"),
        VoiceStyleEntry::new("沉稳女声", "female_calm"),
        VoiceStyleEntry::new("活力女声", "female_energetic"),
        VoiceStyleEntry::new("软糯女童", "2"),
        VoiceStyleEntry::new("低沉男声", "male_calm"),
        VoiceStyleEntry::new("活力男声", "male_energetic"),
        VoiceStyleEntry::new("老年男声", "5"),
        VoiceStyleEntry::new("老年女声", "6"),
    ]
}

/// Ordered style -> voice id lookup. The first entry whose style occurs in a
/// role's `voice_style` wins.
#[derive(Debug, Clone)]
pub struct VoiceStyleTable {
    entries: Vec<VoiceStyleEntry>,
    neutral: String,
}

impl VoiceStyleTable {
    pub fn new(entries: Vec<VoiceStyleEntry>, neutral: impl Into<String>) -> Self {
        Self {
            entries,
            neutral: neutral.into(),
        }
    }

    pub fn neutral(&self) -> &str {
        &self.neutral
    }

    pub fn voice_for(&self, voice_style: &str) -> &str {
        self.entries
            .iter()
            .filter(|e| !e.style.is_empty())
            .find(|e| voice_style.contains(e.style.as_str()))
            .map(|e| e.voice_id.as_str())
            .unwrap_or(self.neutral.as_str())
    }

    pub fn build_voice_map(&self, roles: &[Role]) -> BTreeMap<String, String> {
        roles
            .iter()
            .map(|role| (role.name.clone(), self.voice_for(&role.voice_style).to_string()))
            .collect()
    }
}

impl Default for VoiceStyleTable {
    fn default() -> Self {
        Self::new(default_voice_styles(), NEUTRAL_VOICE)
    }
}
