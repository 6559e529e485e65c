use super::{PromptWriter, TextCache};
use crate::config::{BlockType, Config, ExtraPrompt};
use crate::environment::Environment;
use crate::segments;
use crate::template;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of waiting for the next background segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// The named segment resolved and the prompt changed
    Segment(String),
    /// Nothing resolved within the wait
    Idle,
    /// No segments are pending any more
    Exhausted,
}

#[derive(Debug, Default)]
struct Slot {
    name: String,
    text: String,
    pending: bool,
}

struct Completion {
    block: usize,
    index: usize,
    text: String,
}

/// One request's renderer
///
/// Segment evaluation that outlives the initial deadline keeps running on
/// detached threads and still writes its text to the cache, even after the
/// engine has been dropped.
pub struct Engine {
    config: Config,
    env: Arc<Environment>,
    cache: Arc<dyn TextCache>,
    hidden: HashSet<String>,
    writer: PromptWriter,
    slots: Vec<Vec<Slot>>,
    pending: usize,
    completions: Option<Receiver<Completion>>,
}

impl Engine {
    pub fn new(config: Config, env: Environment, cache: Arc<dyn TextCache>) -> Self {
        let writer = PromptWriter::new(env.flags().plain);
        Self {
            config,
            env: Arc::new(env),
            cache,
            hidden: HashSet::new(),
            writer,
            slots: Vec::new(),
            pending: 0,
            completions: None,
        }
    }

    /// Segment names to leave out entirely
    pub fn with_hidden(mut self, hidden: HashSet<String>) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn pending_count(&self) -> usize {
        self.pending
    }

    /// Start every segment and wait up to `timeout` for them
    ///
    /// Returns the number of segments still running afterwards. Their slots
    /// show the cached placeholder when the cache allows it.
    pub fn render_streaming(&mut self, timeout: Duration) -> usize {
        let (tx, rx) = mpsc::channel();
        self.slots.clear();
        self.pending = 0;

        for (block_index, block) in self.config.blocks.iter().enumerate() {
            let mut block_slots = Vec::with_capacity(block.segments.len());

            for (index, segment) in block.segments.iter().enumerate() {
                let name = segment.name().to_string();
                let mut slot = Slot {
                    name: name.clone(),
                    ..Default::default()
                };

                if self.hidden.contains(&name) {
                    block_slots.push(slot);
                    continue;
                }

                let policy = segment.cache.as_ref();
                let (recompute, use_stale) = self.cache.should_recompute(&name, policy);
                if !recompute {
                    if let Some(text) = self.cache.get(&name, policy) {
                        slot.text = text;
                        block_slots.push(slot);
                        continue;
                    }
                }

                if use_stale {
                    slot.text = self.cache.get(&name, policy).unwrap_or_default();
                }

                let config = segment.clone();
                let env = Arc::clone(&self.env);
                let cache = Arc::clone(&self.cache);
                let tx = tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("segment-{}", name))
                    .spawn(move || {
                        let text = segments::execute(&config, &env);
                        cache.set(config.name(), &text, config.cache.as_ref());
                        // The engine may be gone already; the cache write above still counts.
                        let _ = tx.send(Completion {
                            block: block_index,
                            index,
                            text,
                        });
                    });

                match spawned {
                    Ok(_) => {
                        slot.pending = true;
                        self.pending += 1;
                    }
                    Err(e) => warn!("failed to spawn segment thread for {}: {}", name, e),
                }
                block_slots.push(slot);
            }

            self.slots.push(block_slots);
        }
        drop(tx);
        self.completions = Some(rx);

        let deadline = Instant::now().checked_add(timeout);
        while self.pending > 0 {
            let wait = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if wait.is_zero() {
                break;
            }
            match self.next_completion(wait) {
                Progress::Segment(_) => {}
                Progress::Idle | Progress::Exhausted => break,
            }
        }

        debug!("initial render done, {} segment(s) pending", self.pending);
        self.pending
    }

    /// Wait up to `timeout` for one more background segment
    pub fn next_completion(&mut self, timeout: Duration) -> Progress {
        if self.pending == 0 {
            return Progress::Exhausted;
        }
        let Some(rx) = self.completions.as_ref() else {
            return Progress::Exhausted;
        };

        match rx.recv_timeout(timeout) {
            Ok(completion) => {
                let slot = &mut self.slots[completion.block][completion.index];
                slot.text = completion.text;
                slot.pending = false;
                self.pending -= 1;
                Progress::Segment(slot.name.clone())
            }
            Err(RecvTimeoutError::Timeout) => Progress::Idle,
            Err(RecvTimeoutError::Disconnected) => {
                // A segment thread died without reporting; keep its placeholder
                warn!("{} segment(s) ended without a result", self.pending);
                for slot in self.slots.iter_mut().flatten() {
                    slot.pending = false;
                }
                self.pending = 0;
                Progress::Exhausted
            }
        }
    }

    /// Render with every segment resolved
    pub fn render_blocking(&mut self) {
        self.render_streaming(Duration::MAX);
    }

    pub fn primary(&self) -> String {
        self.render_blocks(BlockType::Prompt)
    }

    pub fn right(&self) -> String {
        self.render_blocks(BlockType::RPrompt)
    }

    /// Every prompt kind this configuration produces
    pub fn prompts(&self) -> HashMap<String, String> {
        let mut prompts = HashMap::new();
        prompts.insert("primary".to_string(), self.primary());
        prompts.insert("right".to_string(), self.right());
        if let Some(extra) = &self.config.secondary_prompt {
            prompts.insert("secondary".to_string(), self.render_extra(extra));
        }
        if let Some(extra) = &self.config.transient_prompt {
            prompts.insert("transient".to_string(), self.render_extra(extra));
        }
        prompts
    }

    fn render_blocks(&self, kind: BlockType) -> String {
        let mut out = String::new();

        for (block, slots) in self.config.blocks.iter().zip(&self.slots) {
            if block.kind != kind {
                continue;
            }

            let parts: Vec<String> = block
                .segments
                .iter()
                .zip(slots)
                .map(|(segment, slot)| {
                    self.writer.paint(
                        &slot.text,
                        segment.foreground.as_deref(),
                        segment.background.as_deref(),
                    )
                })
                .collect();
            let line = self.writer.join(&parts);
            if line.is_empty() {
                continue;
            }

            if !out.is_empty() {
                out.push(if block.newline { '\n' } else { ' ' });
            }
            out.push_str(&line);
        }

        out
    }

    fn render_extra(&self, extra: &ExtraPrompt) -> String {
        let fields = [
            ("Shell", self.env.shell().to_string()),
            ("PWD", self.env.pretty_pwd()),
            ("Code", self.env.flags().error_code.to_string()),
        ];
        let text = template::render(&extra.template, &fields);
        self.writer
            .paint(&text, extra.foreground.as_deref(), extra.background.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CachePolicy, SegmentConfig};
    use crate::daemon::protocol::RenderFlags;
    use crate::render::NoCache;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Cache that returns a fixed decision and records writes
    #[derive(Default)]
    struct ScriptedCache {
        decision: (bool, bool),
        stored: Mutex<HashMap<String, String>>,
    }

    impl TextCache for ScriptedCache {
        fn get(&self, name: &str, _policy: Option<&CachePolicy>) -> Option<String> {
            self.stored.lock().get(name).cloned()
        }

        fn set(&self, name: &str, text: &str, _policy: Option<&CachePolicy>) {
            self.stored.lock().insert(name.to_string(), text.to_string());
        }

        fn should_recompute(&self, _name: &str, _policy: Option<&CachePolicy>) -> (bool, bool) {
            self.decision
        }
    }

    fn config(value: serde_json::Value) -> Config {
        serde_json::from_value(value).unwrap()
    }

    fn plain_env() -> Environment {
        Environment::new(
            RenderFlags {
                plain: true,
                ..Default::default()
            },
            HashMap::new(),
        )
    }

    fn text(alias: &str, text: &str) -> serde_json::Value {
        json!({ "type": "text", "alias": alias, "properties": { "text": text } })
    }

    fn slow(alias: &str, seconds: &str, output: &str) -> serde_json::Value {
        json!({
            "type": "command",
            "alias": alias,
            "properties": { "command": format!("sleep {}; echo {}", seconds, output) }
        })
    }

    #[test]
    fn test_blocks_and_right_prompt() {
        let config = config(json!({
            "blocks": [
                { "type": "prompt", "segments": [ text("a", "one"), text("b", "two") ] },
                { "type": "prompt", "newline": true, "segments": [ text("c", "❯") ] },
                { "type": "rprompt", "segments": [ text("r", "right") ] }
            ]
        }));
        let mut engine = Engine::new(config, plain_env(), Arc::new(NoCache));
        engine.render_blocking();

        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.primary(), "one two\n❯");
        assert_eq!(engine.right(), "right");
    }

    #[test]
    fn test_slow_segment_streams() {
        let config = config(json!({
            "blocks": [ { "segments": [ text("fast", "fast"), slow("slow", "0.3", "done") ] } ]
        }));
        let mut engine = Engine::new(config, plain_env(), Arc::new(NoCache));

        let pending = engine.render_streaming(Duration::from_millis(50));
        assert_eq!(pending, 1);
        assert_eq!(engine.primary(), "fast");

        assert_eq!(
            engine.next_completion(Duration::from_secs(5)),
            Progress::Segment("slow".to_string())
        );
        assert_eq!(engine.primary(), "fast done");
        assert_eq!(engine.next_completion(Duration::from_millis(1)), Progress::Exhausted);
    }

    #[test]
    fn test_stale_placeholder_then_cached_result() {
        let cache = Arc::new(ScriptedCache {
            decision: (true, true),
            ..Default::default()
        });
        cache.set("slow", "old", None);

        let config = config(json!({
            "blocks": [ { "segments": [ slow("slow", "0.2", "new") ] } ]
        }));
        let mut engine = Engine::new(config, plain_env(), cache.clone());

        assert_eq!(engine.render_streaming(Duration::from_millis(20)), 1);
        assert_eq!(engine.primary(), "old");

        engine.next_completion(Duration::from_secs(5));
        assert_eq!(engine.primary(), "new");
        assert_eq!(cache.get("slow", None).as_deref(), Some("new"));
    }

    #[test]
    fn test_fresh_cache_skips_execution() {
        let cache = Arc::new(ScriptedCache {
            decision: (false, false),
            ..Default::default()
        });
        cache.set("slow", "cached", None);

        let config = config(json!({
            "blocks": [ { "segments": [ slow("slow", "5", "never") ] } ]
        }));
        let mut engine = Engine::new(config, plain_env(), cache);

        assert_eq!(engine.render_streaming(Duration::from_millis(10)), 0);
        assert_eq!(engine.primary(), "cached");
    }

    #[test]
    fn test_hidden_segments_skipped() {
        let config = config(json!({
            "blocks": [ { "segments": [ text("a", "shown"), text("b", "hidden") ] } ]
        }));
        let hidden = HashSet::from(["b".to_string()]);
        let mut engine = Engine::new(config, plain_env(), Arc::new(NoCache)).with_hidden(hidden);
        engine.render_blocking();
        assert_eq!(engine.primary(), "shown");
    }

    #[test]
    fn test_extra_prompts() {
        let config = config(json!({
            "blocks": [],
            "transient_prompt": { "template": "{{ .Shell }}> " }
        }));
        let env = Environment::new(
            RenderFlags {
                plain: true,
                shell: "zsh".to_string(),
                ..Default::default()
            },
            HashMap::new(),
        );
        let mut engine = Engine::new(config, env, Arc::new(NoCache));
        engine.render_blocking();

        let prompts = engine.prompts();
        assert_eq!(prompts["transient"], "zsh> ");
        assert!(!prompts.contains_key("secondary"));
    }

    #[test]
    fn test_unused_segment_config_is_harmless() {
        let segment = SegmentConfig {
            kind: "nope".to_string(),
            ..Default::default()
        };
        let mut config = Config::default();
        config.blocks.push(crate::config::Block {
            segments: vec![segment],
            ..Default::default()
        });
        let mut engine = Engine::new(config, plain_env(), Arc::new(NoCache));
        engine.render_blocking();
        assert_eq!(engine.primary(), "");
    }
}
