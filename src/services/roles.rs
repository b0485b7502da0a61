use crate::core::error::PipelineError;
use crate::core::state::{is_unknown, Role, RoleRoster, UNKNOWN};
use crate::services::llm::LlmClient;
use crate::services::script::parse_model_json;
use crate::services::voice_map::{default_voice_styles, VoiceStyleEntry, VoiceStyleTable, NEUTRAL_VOICE};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

const DEFAULT_ROLE_PROMPT: &str = r#"请分析以下小说文本，提取所有出场角色的信息，严格按照 JSON 格式输出（仅输出 JSON，无其他解释）：
要求：
1. 角色信息包含：
   - name：角色名称（必填）；
   - gender：性别（男/女/unknown）；
   - age：年龄（具体数字或年龄段，如 "28"、"30-40"）；
   - personality：性格特征（如 "温柔、冷静"）；
   - voice_style：语音风格，尽量从以下选项中选择：{styles}；
   - description：角色简要描述（100 字内）。
2. 仅提取有具体情节或台词的角色，忽略路人和背景角色；
3. 若信息未提及，对应字段填 "unknown"；
4. JSON 格式为数组，示例：
[
    {"name": "顾盼", "gender": "女", "age": "26", "personality": "温柔、敏感", "voice_style": "沉稳女声", "description": "女主角，咖啡馆店员"}
]

小说文本：
{text}"#;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RolesConfig {
    /// Custom prompt with `{text}` (and optionally `{styles}`) placeholders.
    pub prompt_template: Option<String>,
    #[serde(default = "default_voice_styles")]
    pub voice_styles: Vec<VoiceStyleEntry>,
    #[serde(default = "default_neutral_voice")]
    pub neutral_voice: String,
}

fn default_neutral_voice() -> String {
    NEUTRAL_VOICE.to_string()
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            prompt_template: None,
            voice_styles: default_voice_styles(),
            neutral_voice: default_neutral_voice(),
        }
    }
}

impl RolesConfig {
    pub fn voice_table(&self) -> VoiceStyleTable {
        VoiceStyleTable::new(self.voice_styles.clone(), self.neutral_voice.clone())
    }
}

pub struct RoleExtractor<'a> {
    llm: &'a dyn LlmClient,
    template: String,
    styles: String,
}

impl<'a> RoleExtractor<'a> {
    pub fn new(llm: &'a dyn LlmClient, config: &RolesConfig) -> Self {
        Self {
            llm,
            template: config
                .prompt_template
                .clone()
                .unwrap_or_else(|| DEFAULT_ROLE_PROMPT.to_string()),
            styles: config
                .voice_styles
                .iter()
                .map(|e| e.style.as_str())
                .collect::<Vec<_>>()
                .join("、"),
        }
    }

    pub fn build_prompt(&self, chunk: &str) -> String {
        self.template
            .replace("{styles}", &self.styles)
            .replace("{text}", chunk)
    }

    pub async fn extract(&self, chunk: &str) -> Result<Vec<Role>> {
        let response = self.llm.chat(&self.build_prompt(chunk)).await?;
        Ok(parse_roles(&response)?)
    }
}

/// Lenient parsing: anything that does not look like a named role is
/// dropped, absent attributes become `unknown`.
pub fn parse_roles(response: &str) -> Result<Vec<Role>, PipelineError> {
    let value = parse_model_json(response)?;
    let items = match &value {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("roles").or_else(|| obj.get("characters")) {
            Some(Value::Array(items)) => items,
            _ => return Err(not_an_array(&value)),
        },
        _ => return Err(not_an_array(&value)),
    };

    Ok(items.iter().filter_map(role_from_value).collect())
}

fn not_an_array(value: &Value) -> PipelineError {
    PipelineError::MalformedModelOutput {
        reason: "expected a JSON array of roles".to_string(),
        output: value.to_string(),
    }
}

fn role_from_value(value: &Value) -> Option<Role> {
    let obj = value.as_object()?;
    let name = obj.get("name").and_then(value_to_string)?;
    if is_unknown(&name) {
        return None;
    }

    let field = |key: &str| {
        obj.get(key)
            .and_then(value_to_string)
            .filter(|v| !is_unknown(v))
            .unwrap_or_else(|| UNKNOWN.to_string())
    };

    Some(Role {
        gender: field("gender"),
        age: field("age"),
        personality: field("personality"),
        voice_style: field("voice_style"),
        description: field("description"),
        name,
    })
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_to_string).collect();
            Some(parts.join("、"))
        }
        Value::Null | Value::Object(_) => None,
    }
}

/// Folds per-chunk role lists into one roster sorted by name. Known values
/// fill unknown ones; between two known values the first seen is kept.
pub fn merge_roles(chunks: &[Vec<Role>]) -> Vec<Role> {
    let mut table: BTreeMap<String, Role> = BTreeMap::new();

    for role in chunks.iter().flatten() {
        match table.entry(role.name.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(role.clone());
            }
            Entry::Occupied(mut slot) => {
                let stored = slot.get_mut();
                for (current, incoming) in stored.attributes_mut().into_iter().zip(role.attributes()) {
                    if is_unknown(current.as_str()) && !is_unknown(incoming) {
                        *current = incoming.clone();
                    }
                }
            }
        }
    }

    table.into_values().collect()
}

pub fn build_roster(roles: Vec<Role>, table: &VoiceStyleTable) -> RoleRoster {
    let chattts_voice_map = table.build_voice_map(&roles);
    RoleRoster {
        total_roles: roles.len(),
        chattts_voice_map,
        roles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn role_with_age(name: &str, age: &str) -> Role {
        Role {
            age: age.to_string(),
            ..Role::new(name)
        }
    }

    #[test]
    fn test_parse_roles_fills_missing_fields() {
        let response = r#"```json
[
  {"name": "顾盼", "gender": "女", "age": 26, "voice_style": "沉稳女声"},
  {"name": "陆沉", "personality": ["冷静", "寡言"]},
  {"name": "未知", "gender": "男"},
  {"gender": "女"},
  "not a role",
  {"name": ""}
]
```"#;
        let roles = parse_roles(response).unwrap();
        assert_eq!(roles.len(), 2);

        assert_eq!(roles[0].name, "顾盼");
        assert_eq!(roles[0].age, "26");
        assert_eq!(roles[0].personality, UNKNOWN);
        assert_eq!(roles[0].description, UNKNOWN);

        assert_eq!(roles[1].name, "陆沉");
        assert_eq!(roles[1].personality, "冷静、寡言");
        assert_eq!(roles[1].voice_style, UNKNOWN);
    }

    #[test]
    fn test_parse_roles_accepts_wrapped_array() {
        let roles = parse_roles(r#"{"characters": [{"name": "Hero", "gender": "Male"}]}"#).unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].gender, "Male");
    }

    #[test]
    fn test_parse_roles_malformed() {
        assert!(matches!(
            parse_roles("抱歉，我无法处理该请求。"),
            Err(PipelineError::MalformedModelOutput { .. })
        ));
        assert!(matches!(
            parse_roles(r#"{"answer": 42}"#),
            Err(PipelineError::MalformedModelOutput { .. })
        ));
    }

    #[test]
    fn test_merge_fills_gaps_in_either_order() {
        let a_unknown = vec![role_with_age("A", "unknown")];
        let a_30 = vec![role_with_age("A", "30")];

        let forward = merge_roles(&[a_unknown.clone(), a_30.clone()]);
        let backward = merge_roles(&[a_30, a_unknown]);

        assert_eq!(forward, vec![role_with_age("A", "30")]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_merge_first_seen_wins_on_conflict() {
        let merged = merge_roles(&[
            vec![role_with_age("A", "30")],
            vec![role_with_age("A", "40")],
        ]);
        assert_eq!(merged[0].age, "30");

        let reversed = merge_roles(&[
            vec![role_with_age("A", "40")],
            vec![role_with_age("A", "30")],
        ]);
        assert_eq!(reversed[0].age, "40");
    }

    #[test]
    fn test_merge_is_idempotent_and_sorted() {
        let roster = merge_roles(&[vec![
            Role {
                gender: "女".to_string(),
                ..Role::new("顾盼")
            },
            role_with_age("Bob", "40"),
            Role::new("Alice"),
        ]]);
        let names: Vec<&str> = roster.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob", "顾盼"]);

        let again = merge_roles(&[roster.clone(), roster.clone()]);
        assert_eq!(again, roster);
    }

    #[test]
    fn test_build_roster() {
        let roles = vec![
            Role {
                voice_style: "低沉男声".to_string(),
                ..Role::new("陆沉")
            },
            Role::new("顾盼"),
        ];
        let roster = build_roster(roles, &VoiceStyleTable::default());
        assert_eq!(roster.total_roles, 2);
        assert_eq!(roster.chattts_voice_map["陆沉"], "male_calm");
        assert_eq!(roster.chattts_voice_map["顾盼"], "neutral");
    }

    #[derive(Debug)]
    struct EchoLlm;

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn chat(&self, prompt: &str) -> Result<String> {
            assert!(prompt.contains("沉稳女声、活力女声"));
            assert!(prompt.ends_with("顾盼推门而入。"));
            Ok(r#"[{"name": "顾盼"}]"#.to_string())
        }
    }

    #[tokio::test]
    async fn test_extract_uses_prompt_template() -> Result<()> {
        let llm = EchoLlm;
        let extractor = RoleExtractor::new(&llm, &RolesConfig::default());
        let roles = extractor.extract("顾盼推门而入。").await?;
        assert_eq!(roles, vec![Role::new("顾盼")]);
        Ok(())
    }
}
