use crate::core::config::Config;
use crate::core::io::Storage;
use crate::core::state::{Role, RoleRoster, Segment};
use crate::services::chunker::{normalize_text, split_text, TextChunk};
use crate::services::llm::{LlmClient, ModerationFilter};
use crate::services::roles::{build_roster, merge_roles, RoleExtractor};
use crate::services::script::SegmentAnnotator;
use crate::services::synthesizer::{AudioSynthesizer, RenderSummary, VoiceResolver};
use crate::services::tts::TtsEngine;
use anyhow::{Context, Result};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

const SKIPPED_PREVIEW_CHARS: usize = 200;

/// Runs role extraction, segment annotation and synthesis in order, reusing
/// any stage output that already exists on disk.
pub struct PipelineManager {
    config: Config,
    llm: Box<dyn LlmClient>,
    tts: Box<dyn TtsEngine>,
    storage: Arc<dyn Storage>,
    moderation: ModerationFilter,
}

impl PipelineManager {
    pub fn new(
        config: Config,
        llm: Box<dyn LlmClient>,
        tts: Box<dyn TtsEngine>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let moderation = ModerationFilter::new(&config.llm.moderation);
        Self {
            config,
            llm,
            tts,
            storage,
            moderation,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let roles_path = &self.config.roles_path;
        let roster = match self.load_json::<RoleRoster>(roles_path).await? {
            Some(roster) => {
                println!("Loading cached roles from {}", roles_path);
                roster
            }
            None => {
                println!("Extracting roles...");
                let roster = self.extract_roles().await?;
                self.write_json(roles_path, &roster).await?;
                println!("Found {} roles, saved to {}", roster.total_roles, roles_path);
                roster
            }
        };

        if !self.confirm("Continue to segment annotation?") {
            return Ok(());
        }

        let segments_path = &self.config.segments_path;
        let segments = match self.load_json::<Vec<Segment>>(segments_path).await? {
            Some(segments) => {
                println!("Loading cached segments from {}", segments_path);
                segments
            }
            None => {
                println!("Annotating segments...");
                let segments = self.annotate_segments(&roster).await?;
                self.write_json(segments_path, &segments).await?;
                println!("Produced {} segments, saved to {}", segments.len(), segments_path);
                segments
            }
        };

        if !self.confirm("Continue to audio synthesis?") {
            return Ok(());
        }

        let output = &self.config.output_audio;
        if self.storage.exists(output).await? {
            println!("Output already exists, skipping synthesis: {}", output);
        } else {
            println!("Synthesizing audio ({} segments)...", segments.len());
            let summary = self.synthesize_audio(&segments, Some(&roster)).await?;
            println!(
                "Audio complete: {} ({:.1}s, {} clips, {} failed)",
                output,
                summary.duration,
                summary.clips_written,
                summary.failed.len()
            );
        }

        println!("All stages complete!");
        Ok(())
    }

    /// Stage 1: per-chunk role extraction merged into one roster.
    pub async fn extract_roles(&self) -> Result<RoleRoster> {
        let chunks = self.read_chunks().await?;
        let extractor = RoleExtractor::new(self.llm.as_ref(), &self.config.roles);
        let extractor = &extractor;

        let pb = progress_bar(chunks.len())?;
        let mut results = futures_util::stream::iter(chunks.iter())
            .map(|chunk| {
                let pb = pb.clone();
                async move {
                    let result: Result<Vec<Role>> = extractor.extract(&chunk.text).await;
                    pb.inc(1);
                    (chunk.index, result)
                }
            })
            .buffer_unordered(self.llm_concurrency());

        let mut per_chunk = empty_slots(chunks.len());
        while let Some((i, result)) = results.next().await {
            per_chunk[i] = self.settle_chunk("roles", &chunks[i], result).await?;
        }
        pb.finish_with_message("Role extraction complete");

        let roles = merge_roles(&per_chunk);
        Ok(build_roster(roles, &self.config.roles.voice_table()))
    }

    /// Stage 2: per-chunk segment annotation, concatenated in chunk order.
    pub async fn annotate_segments(&self, roster: &RoleRoster) -> Result<Vec<Segment>> {
        let chunks = self.read_chunks().await?;
        let annotator = SegmentAnnotator::new(self.llm.as_ref(), &self.config.segments);
        let annotator = &annotator;

        let pb = progress_bar(chunks.len())?;
        let mut results = futures_util::stream::iter(chunks.iter())
            .map(|chunk| {
                let pb = pb.clone();
                async move {
                    let result: Result<Vec<Segment>> = annotator.annotate(&chunk.text, roster).await;
                    pb.inc(1);
                    (chunk.index, result)
                }
            })
            .buffer_unordered(self.llm_concurrency());

        let mut per_chunk = empty_slots(chunks.len());
        while let Some((i, result)) = results.next().await {
            per_chunk[i] = self.settle_chunk("segments", &chunks[i], result).await?;
        }
        pb.finish_with_message("Annotation complete");

        Ok(per_chunk.into_iter().flatten().collect())
    }

    /// Stage 3: synthesize and merge into `output_audio`.
    pub async fn synthesize_audio(
        &self,
        segments: &[Segment],
        roster: Option<&RoleRoster>,
    ) -> Result<RenderSummary> {
        let voices = VoiceResolver::new(
            roster,
            self.config.audio.narrator_voice.as_deref(),
            self.config.roles.voice_table().neutral(),
        );
        let synthesizer = AudioSynthesizer::new(
            self.tts.as_ref(),
            self.storage.as_ref(),
            voices,
            &self.config.audio,
        );
        synthesizer.render(segments, &self.config.output_audio).await
    }

    async fn read_chunks(&self) -> Result<Vec<TextChunk>> {
        let raw = self
            .storage
            .read_to_string(&self.config.novel_path)
            .await
            .with_context(|| format!("Failed to load novel text from {}", self.config.novel_path))?;
        Ok(split_text(&normalize_text(&raw), self.config.chunk_size))
    }

    fn llm_concurrency(&self) -> usize {
        self.config.llm.concurrency.max(1)
    }

    /// Moderation rejections become empty results and are recorded in the
    /// skipped-chunk log; any other failure aborts the stage.
    async fn settle_chunk<T>(
        &self,
        stage: &str,
        chunk: &TextChunk,
        result: Result<Vec<T>>,
    ) -> Result<Vec<T>> {
        match result {
            Ok(items) => Ok(items),
            Err(e) if self.moderation.is_rejection(&e) => {
                warn!(
                    "Skipping chunk {} (offset {}, {} chars): rejected by moderation",
                    chunk.index,
                    chunk.offset,
                    chunk.char_len()
                );
                self.log_skipped(stage, chunk, &e).await?;
                Ok(Vec::new())
            }
            Err(e) => Err(e.context(format!(
                "{} stage failed on chunk {} (offset {}): {}",
                stage,
                chunk.index,
                chunk.offset,
                chunk.preview(50)
            ))),
        }
    }

    async fn log_skipped(&self, stage: &str, chunk: &TextChunk, err: &anyhow::Error) -> Result<()> {
        let entry = format!(
            "[{}] chunk {} offset {} chars {}\nerror: {:#}\ntext: {}\n\n",
            stage,
            chunk.index,
            chunk.offset,
            chunk.char_len(),
            err,
            chunk.preview(SKIPPED_PREVIEW_CHARS)
        );
        self.storage
            .append(&self.config.llm.skipped_log, entry.as_bytes())
            .await
    }

    async fn load_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        if !self.storage.exists(path).await? {
            return Ok(None);
        }
        let content = self.storage.read_to_string(path).await?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse cached {}", path))?;
        Ok(Some(value))
    }

    async fn write_json<T: Serialize>(&self, path: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        self.storage.write(path, content.as_bytes()).await
    }

    fn confirm(&self, message: &str) -> bool {
        if self.config.unattended {
            return true;
        }
        match inquire::Confirm::new(message).with_default(true).prompt() {
            Ok(true) => true,
            Ok(false) => {
                println!("Stopping as requested.");
                false
            }
            Err(_) => {
                println!("Error reading input, stopping.");
                false
            }
        }
    }
}

/// One result slot per chunk, filled by index as results arrive.
fn empty_slots<T>(len: usize) -> Vec<Vec<T>> {
    (0..len).map(|_| Vec::new()).collect()
}

fn progress_bar(len: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}
