use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Sentinel for role attributes the model could not determine.
pub const UNKNOWN: &str = "unknown";

/// Speaker label for narration.
pub const NARRATOR: &str = "旁白";

pub fn is_unknown(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.eq_ignore_ascii_case(UNKNOWN) || value == "未知"
}

pub fn is_narrator(speaker: &str) -> bool {
    let speaker = speaker.trim();
    speaker == NARRATOR || speaker.eq_ignore_ascii_case("narrator")
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    #[serde(default = "unknown")]
    pub gender: String,
    #[serde(default = "unknown")]
    pub age: String,
    #[serde(default = "unknown")]
    pub personality: String,
    #[serde(default = "unknown")]
    pub voice_style: String,
    #[serde(default = "unknown")]
    pub description: String,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gender: unknown(),
            age: unknown(),
            personality: unknown(),
            voice_style: unknown(),
            description: unknown(),
        }
    }

    /// Mutable access to the five optional attributes, in a fixed order.
    pub fn attributes_mut(&mut self) -> [&mut String; 5] {
        [
            &mut self.gender,
            &mut self.age,
            &mut self.personality,
            &mut self.voice_style,
            &mut self.description,
        ]
    }

    pub fn attributes(&self) -> [&String; 5] {
        [
            &self.gender,
            &self.age,
            &self.personality,
            &self.voice_style,
            &self.description,
        ]
    }
}

/// The role roster hand-off file.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RoleRoster {
    pub roles: Vec<Role>,
    /// Role name to TTS voice id.
    pub chattts_voice_map: BTreeMap<String, String>,
    pub total_roles: usize,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Neutral,
    Happy,
    Sad,
    Angry,
    Calm,
    Surprised,
}

impl Emotion {
    pub const ALL: [Emotion; 6] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Calm,
        Emotion::Surprised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Calm => "calm",
            Emotion::Surprised => "surprised",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Emotion::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unsupported emotion '{}'", s))
    }
}

fn default_speed() -> f32 {
    1.0
}

/// One line of narration or dialogue, in playback order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Segment {
    pub text: String,
    pub speaker: String,
    pub emotion: Emotion,
    #[serde(default = "default_speed")]
    pub speed: f32,
}
