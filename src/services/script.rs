use crate::core::error::PipelineError;
use crate::core::state::{Emotion, RoleRoster, Segment, NARRATOR};
use crate::services::llm::LlmClient;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const REQUIRED_FIELDS: [&str; 4] = ["text", "speaker", "emotion", "speed"];

const DEFAULT_SEGMENT_PROMPT: &str = r#"角色档案：
{roles}

请严格按照以下要求处理小说文本，仅输出 JSON 格式结果（不要额外解释）：
1. 文本清洗：去除无关空格/重复标点，保留完整语义；
2. 分段断句：按自然语义拆分，每段不超过 200 字；
3. 角色标注：区分「{narrator}」和具体角色名，角色名必须使用角色档案中的 name；
4. 情感标注：仅用 neutral/happy/sad/angry/calm/surprised 标注；
5. 语速建议：0.8~1.2 之间的浮点数（默认 1.0）。

输出格式示例：
[
    {"text": "他缓缓抬起头，眼中满是悲伤。", "speaker": "{narrator}", "emotion": "sad", "speed": 0.9},
    {"text": "你为什么要离开我？", "speaker": "陆沉", "emotion": "angry", "speed": 1.1}
]

小说文本：
{text}"#;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SegmentsConfig {
    /// Custom prompt with `{roles}` and `{text}` placeholders.
    pub prompt_template: Option<String>,
}

/// Removes markdown code fences (and any prose around them) from a model
/// response.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    let Some(start) = s.find("```") else {
        return s.to_string();
    };

    let after = &s[start + 3..];
    let body = match after.find('\n') {
        Some(nl) if after[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
            &after[nl + 1..]
        }
        _ => after.trim_start_matches("json"),
    };
    let body = match body.rfind("```") {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim().to_string()
}

/// Strips fences and parses the remainder as JSON.
pub fn parse_model_json(response: &str) -> Result<Value, PipelineError> {
    let clean = strip_code_blocks(response);
    serde_json::from_str(&clean).map_err(|e| PipelineError::MalformedModelOutput {
        reason: e.to_string(),
        output: clean,
    })
}

/// Turns a chunk of novel text into speaker/emotion/speed annotated segments.
pub struct SegmentAnnotator<'a> {
    llm: &'a dyn LlmClient,
    template: String,
}

impl<'a> SegmentAnnotator<'a> {
    pub fn new(llm: &'a dyn LlmClient, config: &SegmentsConfig) -> Self {
        Self {
            llm,
            template: config
                .prompt_template
                .clone()
                .unwrap_or_else(|| DEFAULT_SEGMENT_PROMPT.to_string()),
        }
    }

    pub fn build_prompt(&self, chunk: &str, roster: &RoleRoster) -> Result<String> {
        let roles = serde_json::to_string(&roster.roles)?;
        Ok(self
            .template
            .replace("{narrator}", NARRATOR)
            .replace("{roles}", &roles)
            .replace("{text}", chunk))
    }

    pub async fn annotate(&self, chunk: &str, roster: &RoleRoster) -> Result<Vec<Segment>> {
        let prompt = self.build_prompt(chunk, roster)?;
        let response = self.llm.chat(&prompt).await?;
        Ok(parse_segments(&response)?)
    }
}

/// Strict validation: no defaults are filled in, any missing or mistyped
/// field rejects the whole response.
pub fn parse_segments(response: &str) -> Result<Vec<Segment>, PipelineError> {
    let value = parse_model_json(response)?;
    let items = value.as_array().ok_or_else(|| {
        PipelineError::SchemaViolation(format!("expected a JSON array, got: {}", value))
    })?;

    items
        .iter()
        .enumerate()
        .map(|(i, item)| segment_from_value(i, item))
        .collect()
}

fn segment_from_value(index: usize, item: &Value) -> Result<Segment, PipelineError> {
    let obj = item.as_object().ok_or_else(|| {
        PipelineError::SchemaViolation(format!("element {} is not an object: {}", index, item))
    })?;

    if let Some(missing) = REQUIRED_FIELDS.iter().find(|f| !obj.contains_key(**f)) {
        return Err(PipelineError::SchemaViolation(format!(
            "element {} is missing required field '{}': {}",
            index, missing, item
        )));
    }

    let text = string_field(index, obj, "text")?;
    let speaker = string_field(index, obj, "speaker")?;
    let emotion = string_field(index, obj, "emotion")?
        .parse::<Emotion>()
        .map_err(|e| PipelineError::SchemaViolation(format!("element {}: {}", index, e)))?;
    let speed = match &obj["speed"] {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| {
        PipelineError::SchemaViolation(format!(
            "element {}: speed is not a number: {}",
            index, obj["speed"]
        ))
    })?;

    Ok(Segment {
        text,
        speaker,
        emotion,
        speed: speed as f32,
    })
}

fn string_field(index: usize, obj: &Map<String, Value>, field: &str) -> Result<String, PipelineError> {
    obj[field].as_str().map(|s| s.to_string()).ok_or_else(|| {
        PipelineError::SchemaViolation(format!(
            "element {}: '{}' is not a string: {}",
            index, field, obj[field]
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Role;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct MockLlmClient {
        response: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn chat(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.response.clone())
        }
    }

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("json"), "json");
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("  ```json  \n  {}  \n  ```  "), "{}");
        assert_eq!(strip_code_blocks("```json[1, 2]```"), "[1, 2]");
        assert_eq!(
            strip_code_blocks("以下是结果：\n```json\n[]\n```\n希望有帮助"),
            "[]"
        );
    }

    #[test]
    fn test_parse_segments_success() {
        let response = r#"```json
[
  {"text": "他缓缓抬起头。", "speaker": "旁白", "emotion": "sad", "speed": 0.9},
  {"text": "你为什么要离开我？", "speaker": "陆沉", "emotion": "Angry", "speed": "1.1"}
]
```"#;
        let segments = parse_segments(response).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].speaker, "旁白");
        assert_eq!(segments[0].emotion, Emotion::Sad);
        assert!((segments[0].speed - 0.9).abs() < 1e-6);
        assert_eq!(segments[1].emotion, Emotion::Angry);
        assert!((segments[1].speed - 1.1).abs() < 1e-6);
    }

    #[test]
    fn test_missing_field_is_schema_violation() {
        for field in REQUIRED_FIELDS {
            let mut item = serde_json::json!({
                "text": "hello", "speaker": "A", "emotion": "happy", "speed": 1.0
            });
            item.as_object_mut().unwrap().remove(field);
            let response = serde_json::to_string(&vec![item]).unwrap();

            match parse_segments(&response) {
                Err(PipelineError::SchemaViolation(msg)) => assert!(msg.contains(field)),
                other => panic!("expected schema violation for {}, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_non_array_and_non_object_are_schema_violations() {
        assert!(matches!(
            parse_segments(r#"{"text": "hi"}"#),
            Err(PipelineError::SchemaViolation(_))
        ));
        assert!(matches!(
            parse_segments(r#"["just a string"]"#),
            Err(PipelineError::SchemaViolation(_))
        ));
        assert!(matches!(
            parse_segments(r#"[{"text": "x", "speaker": "A", "emotion": "bored", "speed": 1}]"#),
            Err(PipelineError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        assert!(matches!(
            parse_segments("[{\"text\": \"unterminated"),
            Err(PipelineError::MalformedModelOutput { .. })
        ));
    }

    #[tokio::test]
    async fn test_annotate_embeds_roster_and_text() -> Result<()> {
        let llm = MockLlmClient {
            response: r#"[{"text": "你好", "speaker": "顾盼", "emotion": "happy", "speed": 1.0}]"#
                .to_string(),
            prompts: Mutex::new(Vec::new()),
        };
        let roster = RoleRoster {
            roles: vec![Role::new("顾盼")],
            ..Default::default()
        };
        let annotator = SegmentAnnotator::new(&llm, &SegmentsConfig::default());

        let segments = annotator.annotate("顾盼说：你好", &roster).await?;
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].speaker, "顾盼");

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].contains("\"name\":\"顾盼\""));
        assert!(prompts[0].contains("顾盼说：你好"));
        assert!(!prompts[0].contains("{text}"));
        Ok(())
    }
}
