use crate::core::config::AudioConfig;
use crate::core::error::PipelineError;
use crate::core::io::Storage;
use crate::core::state::{is_narrator, RoleRoster, Segment};
use crate::services::tts::{TtsEngine, VoiceParams};
use crate::utils::audio::{concat, AudioBuffer};
use anyhow::{Context, Result};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use zhconv::{zhconv, Variant};

const LOG_PREVIEW_CHARS: usize = 30;

/// Maps a segment's speaker to the voice id handed to the engine.
#[derive(Debug, Clone)]
pub struct VoiceResolver {
    voice_map: BTreeMap<String, String>,
    narrator_voice: String,
    neutral_voice: String,
}

impl VoiceResolver {
    pub fn new(
        roster: Option<&RoleRoster>,
        narrator_voice: Option<&str>,
        neutral_voice: impl Into<String>,
    ) -> Self {
        let neutral_voice = neutral_voice.into();
        Self {
            voice_map: roster
                .map(|r| r.chattts_voice_map.clone())
                .unwrap_or_default(),
            narrator_voice: narrator_voice
                .map(|v| v.to_string())
                .unwrap_or_else(|| neutral_voice.clone()),
            neutral_voice,
        }
    }

    pub fn resolve(&self, speaker: &str) -> &str {
        if is_narrator(speaker) {
            return &self.narrator_voice;
        }
        self.voice_map
            .get(speaker.trim())
            .map(|v| v.as_str())
            .unwrap_or(self.neutral_voice.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderSummary {
    pub clips_written: usize,
    pub skipped_empty: usize,
    pub failed: Vec<usize>,
    /// Seconds of audio in the output file.
    pub duration: f32,
}

enum ClipOutcome {
    Empty,
    Clip(AudioBuffer),
    Failed(PipelineError),
}

pub struct AudioSynthesizer<'a> {
    tts: &'a dyn TtsEngine,
    storage: &'a dyn Storage,
    voices: VoiceResolver,
    simplify_chinese: bool,
    concurrency: usize,
    temp_folder: String,
}

impl<'a> AudioSynthesizer<'a> {
    pub fn new(
        tts: &'a dyn TtsEngine,
        storage: &'a dyn Storage,
        voices: VoiceResolver,
        config: &AudioConfig,
    ) -> Self {
        Self {
            tts,
            storage,
            voices,
            simplify_chinese: config.simplify_chinese,
            concurrency: config.concurrency.unwrap_or_else(|| tts.max_concurrency()).max(1),
            temp_folder: config.temp_folder.clone(),
        }
    }

    /// Temp clip location. The name carries a digest of everything sent to
    /// the engine, so an edited segment never picks up a stale clip.
    fn clip_path(&self, index: usize, text: &str, params: &VoiceParams) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update([0u8]);
        hasher.update(params.voice_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(params.prompt.as_bytes());
        hasher.update(params.temperature.to_be_bytes());
        hasher.update(params.top_p.to_be_bytes());
        hasher.update(params.top_k.to_be_bytes());
        hasher.update(params.speed.to_be_bytes());
        let digest = hasher.finalize();
        let key: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();

        Path::new(&self.temp_folder)
            .join(format!("segment_{:04}_{}.wav", index, key))
            .to_string_lossy()
            .to_string()
    }

    pub fn voice_params(&self, segment: &Segment) -> VoiceParams {
        VoiceParams::for_emotion(
            segment.emotion,
            self.voices.resolve(&segment.speaker),
            segment.speed,
        )
    }

    /// Synthesizes every segment and writes the merged WAV to `output`.
    /// Empty and failing segments are left out; order is kept.
    pub async fn render(&self, segments: &[Segment], output: &str) -> Result<RenderSummary> {
        let pb = ProgressBar::new(segments.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
                .progress_chars("#>-"),
        );

        let mut results: Vec<(usize, ClipOutcome)> = futures_util::stream::iter(segments.iter().enumerate())
            .map(|(i, segment)| {
                let pb = pb.clone();
                async move {
                    let outcome = self.render_segment(i, segment).await;
                    pb.inc(1);
                    (i, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        pb.finish_with_message("Synthesis complete");

        results.sort_by_key(|(i, _)| *i);

        let mut summary = RenderSummary::default();
        let mut clips = Vec::new();
        for (i, outcome) in results {
            match outcome {
                ClipOutcome::Empty => summary.skipped_empty += 1,
                ClipOutcome::Clip(clip) => clips.push(clip),
                ClipOutcome::Failed(e) => {
                    warn!("{} (text: {})", e, preview(&segments[i].text));
                    summary.failed.push(i);
                }
            }
        }
        summary.clips_written = clips.len();

        if clips.is_empty() {
            self.storage.delete(&self.temp_folder).await?;
            return Err(PipelineError::EmptyOutput.into());
        }

        let merged = concat(&clips)?;
        summary.duration = merged.duration();
        self.storage
            .write(output, &merged.to_wav_bytes()?)
            .await
            .with_context(|| format!("Failed to write {}", output))?;

        self.storage.delete(&self.temp_folder).await?;

        info!(
            "Rendered {} clips ({} empty, {} failed), {:.1}s -> {}",
            summary.clips_written,
            summary.skipped_empty,
            summary.failed.len(),
            summary.duration,
            output
        );
        Ok(summary)
    }

    async fn render_segment(&self, index: usize, segment: &Segment) -> ClipOutcome {
        let text = segment.text.trim();
        if text.is_empty() {
            return ClipOutcome::Empty;
        }

        let text = if self.simplify_chinese {
            zhconv(text, Variant::ZhCN)
        } else {
            text.to_string()
        };
        let params = self.voice_params(segment);

        let path = self.clip_path(index, &text, &params);
        if let Some(clip) = self.cached_clip(&path).await {
            debug!("Reusing {}", path);
            return ClipOutcome::Clip(clip);
        }

        match self.synthesize(&text, &params, &path).await {
            Ok(clip) => ClipOutcome::Clip(clip),
            Err(e) => ClipOutcome::Failed(PipelineError::SynthesisFailure {
                index,
                message: format!("{:#}", e),
            }),
        }
    }

    async fn cached_clip(&self, path: &str) -> Option<AudioBuffer> {
        if !self.storage.exists(path).await.ok()? {
            return None;
        }
        let bytes = self.storage.read(path).await.ok()?;
        AudioBuffer::from_wav_bytes(&bytes)
            .ok()
            .filter(|clip| clip.sample_rate == self.tts.sample_rate())
    }

    async fn synthesize(&self, text: &str, params: &VoiceParams, path: &str) -> Result<AudioBuffer> {
        let clip = self.tts.synthesize(text, params).await?;
        if clip.sample_rate != self.tts.sample_rate() {
            anyhow::bail!(
                "engine returned {} Hz audio, expected {} Hz",
                clip.sample_rate,
                self.tts.sample_rate()
            );
        }
        self.storage.write(path, &clip.to_wav_bytes()?).await?;
        Ok(clip)
    }
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(LOG_PREVIEW_CHARS).collect();
    if text.chars().count() > LOG_PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::state::Emotion;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns a constant tone per text: `level` maps text -> sample value.
    struct ToneTts {
        levels: BTreeMap<String, f32>,
        len: usize,
        calls: Mutex<Vec<(String, VoiceParams)>>,
    }

    impl ToneTts {
        fn new(levels: &[(&str, f32)], len: usize) -> Self {
            Self {
                levels: levels.iter().map(|(t, v)| (t.to_string(), *v)).collect(),
                len,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TtsEngine for ToneTts {
        async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<AudioBuffer> {
            self.calls
                .lock()
                .unwrap()
                .push((text.to_string(), params.clone()));
            match self.levels.get(text) {
                Some(level) => Ok(AudioBuffer::new(vec![*level; self.len], 24000)),
                None => Err(anyhow::anyhow!("engine exploded")),
            }
        }

        fn max_concurrency(&self) -> usize {
            3
        }
    }

    fn segment(text: &str, speaker: &str) -> Segment {
        Segment {
            text: text.to_string(),
            speaker: speaker.to_string(),
            emotion: Emotion::Neutral,
            speed: 1.0,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: AudioConfig,
        output: String,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = AudioConfig {
            temp_folder: dir.path().join("temp").to_string_lossy().to_string(),
            ..AudioConfig::default()
        };
        let output = dir.path().join("out").join("novel.wav").to_string_lossy().to_string();
        Fixture {
            _dir: dir,
            config,
            output,
        }
    }

    fn neutral_voices() -> VoiceResolver {
        VoiceResolver::new(None, None, "neutral")
    }

    #[tokio::test]
    async fn test_order_preserved_and_failure_dropped() -> Result<()> {
        let fx = fixture();
        let tts = ToneTts::new(&[("s0", 0.1), ("s2", 0.3)], 100);
        let storage = NativeStorage::new();
        let synth = AudioSynthesizer::new(&tts, &storage, neutral_voices(), &fx.config);

        let segments = vec![segment("s0", "旁白"), segment("s1", "旁白"), segment("s2", "旁白")];
        let summary = synth.render(&segments, &fx.output).await?;

        assert_eq!(summary.clips_written, 2);
        assert_eq!(summary.failed, vec![1]);
        assert!((summary.duration - 200.0 / 24000.0).abs() < 1e-6);

        let merged = AudioBuffer::from_wav_bytes(&std::fs::read(&fx.output)?)?;
        assert_eq!(merged.len(), 200);
        assert!(merged.samples[..100].iter().all(|s| (*s - 0.1).abs() < 1e-3));
        assert!(merged.samples[100..].iter().all(|s| (*s - 0.3).abs() < 1e-3));

        assert!(!Path::new(&fx.config.temp_folder).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_no_clips_is_empty_output() {
        let fx = fixture();
        let tts = ToneTts::new(&[], 100);
        let storage = NativeStorage::new();
        let synth = AudioSynthesizer::new(&tts, &storage, neutral_voices(), &fx.config);

        let segments = vec![segment("   ", "旁白"), segment("boom", "A")];
        let err = synth.render(&segments, &fx.output).await.unwrap_err();

        assert!(matches!(
            PipelineError::find(&err),
            Some(PipelineError::EmptyOutput)
        ));
        assert!(!Path::new(&fx.output).exists());
        // The blank segment never reaches the engine.
        assert_eq!(tts.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_existing_clips_are_reused() -> Result<()> {
        let fx = fixture();
        let tts = ToneTts::new(&[("s0", 0.1), ("s1", 0.3)], 50);
        let storage = NativeStorage::new();
        let synth = AudioSynthesizer::new(&tts, &storage, neutral_voices(), &fx.config);

        let segments = [segment("s0", "旁白"), segment("s1", "旁白")];
        let cached = AudioBuffer::new(vec![-0.5; 80], 24000);
        let path = synth.clip_path(0, "s0", &synth.voice_params(&segments[0]));
        storage.write(&path, &cached.to_wav_bytes()?).await?;

        let summary = synth.render(&segments, &fx.output).await?;

        assert_eq!(summary.clips_written, 2);
        let calls = tts.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "s1");

        let merged = AudioBuffer::from_wav_bytes(&std::fs::read(&fx.output)?)?;
        assert_eq!(merged.len(), 130);
        assert!(merged.samples[0] < -0.4);
        Ok(())
    }

    #[tokio::test]
    async fn test_clip_from_edited_segment_is_not_reused() -> Result<()> {
        let fx = fixture();
        let tts = ToneTts::new(&[("new text", 0.3)], 50);
        let storage = NativeStorage::new();
        let synth = AudioSynthesizer::new(&tts, &storage, neutral_voices(), &fx.config);

        // Left behind by an interrupted run over an older segments file.
        let old = segment("old text", "旁白");
        let stale = AudioBuffer::new(vec![0.1; 80], 24000);
        let stale_path = synth.clip_path(0, "old text", &synth.voice_params(&old));
        storage.write(&stale_path, &stale.to_wav_bytes()?).await?;

        synth.render(&[segment("new text", "旁白")], &fx.output).await?;

        assert_eq!(tts.calls.lock().unwrap().len(), 1);
        let merged = AudioBuffer::from_wav_bytes(&std::fs::read(&fx.output)?)?;
        assert_eq!(merged.len(), 50);
        assert!(merged.samples.iter().all(|s| (*s - 0.3).abs() < 1e-3));
        Ok(())
    }

    #[test]
    fn test_clip_path_tracks_voice_and_emotion() {
        let fx = fixture();
        let tts = ToneTts::new(&[], 10);
        let storage = NativeStorage::new();
        let synth = AudioSynthesizer::new(&tts, &storage, neutral_voices(), &fx.config);

        let calm = VoiceParams::for_emotion(Emotion::Calm, "neutral", 1.0);
        let happy = VoiceParams::for_emotion(Emotion::Happy, "neutral", 1.0);
        let other_voice = VoiceParams::for_emotion(Emotion::Calm, "male_calm", 1.0);
        let faster = VoiceParams::for_emotion(Emotion::Calm, "neutral", 1.2);

        let base = synth.clip_path(3, "line", &calm);
        assert_eq!(base, synth.clip_path(3, "line", &calm));
        assert!(base.contains("segment_0003_"));
        assert_ne!(base, synth.clip_path(3, "line", &happy));
        assert_ne!(base, synth.clip_path(3, "line", &other_voice));
        assert_ne!(base, synth.clip_path(3, "line", &faster));
        assert_ne!(base, synth.clip_path(4, "line", &calm));
    }

    #[test]
    fn test_concurrency_override() {
        let fx = fixture();
        let tts = ToneTts::new(&[], 10);
        let storage = NativeStorage::new();

        let synth = AudioSynthesizer::new(&tts, &storage, neutral_voices(), &fx.config);
        assert_eq!(synth.concurrency, 3);

        let config = AudioConfig {
            concurrency: Some(2),
            ..fx.config.clone()
        };
        let synth = AudioSynthesizer::new(&tts, &storage, neutral_voices(), &config);
        assert_eq!(synth.concurrency, 2);
    }

    #[tokio::test]
    async fn test_voice_and_emotion_reach_engine() -> Result<()> {
        let fx = fixture();
        let tts = ToneTts::new(&[("你好", 0.1), ("他走了。", 0.2), ("路人甲", 0.3)], 10);
        let storage = NativeStorage::new();
        let roster = RoleRoster {
            chattts_voice_map: BTreeMap::from([("顾盼".to_string(), "female_calm".to_string())]),
            ..Default::default()
        };
        let voices = VoiceResolver::new(Some(&roster), Some("narrator_voice"), "neutral");
        let config = AudioConfig {
            concurrency: Some(1),
            ..fx.config.clone()
        };
        let synth = AudioSynthesizer::new(&tts, &storage, voices, &config);

        let mut greeting = segment("你好", "顾盼");
        greeting.emotion = Emotion::Happy;
        greeting.speed = 1.2;
        synth
            .render(
                &[greeting, segment("他走了。", "Narrator"), segment("路人甲", "路人")],
                &fx.output,
            )
            .await?;

        let calls = tts.calls.lock().unwrap();
        assert_eq!(calls[0].1.voice_id, "female_calm");
        assert_eq!(calls[0].1.prompt, "[happy]");
        assert_eq!(calls[0].1.top_k, 15);
        assert!((calls[0].1.speed - 1.2).abs() < 1e-6);
        assert_eq!(calls[1].1.voice_id, "narrator_voice");
        assert_eq!(calls[2].1.voice_id, "neutral");
        Ok(())
    }

    #[tokio::test]
    async fn test_simplify_chinese() -> Result<()> {
        let fx = fixture();
        let tts = ToneTts::new(&[("说话", 0.1)], 10);
        let storage = NativeStorage::new();
        let config = AudioConfig {
            simplify_chinese: true,
            ..fx.config.clone()
        };
        let synth = AudioSynthesizer::new(&tts, &storage, neutral_voices(), &config);

        synth.render(&[segment("說話", "旁白")], &fx.output).await?;
        assert_eq!(tts.calls.lock().unwrap()[0].0, "说话");
        Ok(())
    }

    #[test]
    fn test_resolver_without_roster() {
        let voices = VoiceResolver::new(None, None, "neutral");
        assert_eq!(voices.resolve("旁白"), "neutral");
        assert_eq!(voices.resolve("顾盼"), "neutral");
    }
}
