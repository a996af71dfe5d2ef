//! Parser cache and compiler.
//!
//! Two caches sit in front of the grammar engine:
//!
//! - compiled parsers keyed by [`grammar_key`], kept in insertion order and
//!   truncated to the newest `compiled_parser_retain` entries once more than
//!   `compiled_parser_limit` accumulate;
//! - parse results keyed by [`result_key`], a strict LRU of
//!   `parse_cache_size` entries.
//!
//! Compilation and parsing run on the [`WorkerPool`] under wall-clock
//! bounds. Every outcome, including grammar errors and timeouts, comes back
//! as a classified [`ParseResult`].

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use larkline_grammar::{Budget, CompileError, CompileOptions, ParseFailure};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::LiveConfig;
use crate::engine::{CompiledGrammar, GrammarEngine, LarkEngine};
use crate::error::{LiveError, LiveResult};
use crate::fingerprint::{grammar_key, result_key, short};
use crate::model::{AstNode, ErrorDetail, ParseResult, ParseSettings, ValidationResult};
use crate::worker::{WorkOutcome, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Successful parses since startup
    pub parse_count: u64,
    /// Entries in the result cache
    pub cache_size: usize,
    /// Compiled parsers held
    pub active_parsers: usize,
    /// Worker pool size
    pub workers: usize,
    /// Workers currently compiling or parsing
    pub busy_workers: usize,
}

/// Outcome of fetching a compiled parser.
enum Compiled {
    Ready(Arc<dyn CompiledGrammar>),
    Failed(ErrorDetail),
}

pub struct ParserCache {
    engine: Arc<dyn GrammarEngine>,
    pool: WorkerPool,
    results: Mutex<LruCache<String, Arc<ParseResult>>>,
    compiled: Mutex<IndexMap<String, Arc<dyn CompiledGrammar>>>,
    parse_count: AtomicU64,
    max_grammar_size: usize,
    max_text_length: usize,
    max_parse_time: Duration,
    compiled_limit: usize,
    compiled_retain: usize,
}

impl std::fmt::Debug for ParserCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserCache")
            .field("stats", &self.stats())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl ParserCache {
    pub fn new(config: &LiveConfig) -> Self {
        Self::with_engine(config, Arc::new(LarkEngine))
    }

    pub fn with_engine(config: &LiveConfig, engine: Arc<dyn GrammarEngine>) -> Self {
        let capacity = NonZeroUsize::new(config.parse_cache_size).unwrap_or(NonZeroUsize::MIN);
        ParserCache {
            engine,
            pool: WorkerPool::new(config.worker_threads),
            results: Mutex::new(LruCache::new(capacity)),
            compiled: Mutex::new(IndexMap::new()),
            parse_count: AtomicU64::new(0),
            max_grammar_size: config.max_grammar_size,
            max_text_length: config.max_text_length,
            max_parse_time: config.max_parse_time,
            compiled_limit: config.compiled_parser_limit,
            compiled_retain: config.compiled_parser_retain.min(config.compiled_parser_limit),
        }
    }

    // ──────────────────────────────────────────────
    // Parsing
    // ──────────────────────────────────────────────

    /// Parse `text` with `grammar`, serving and filling the result cache
    /// when `use_cache` is set.
    ///
    /// Fails only when the worker pool is closed.
    pub async fn parse_with_cache(
        &self,
        grammar: &str,
        text: &str,
        settings: &ParseSettings,
        use_cache: bool,
    ) -> LiveResult<Arc<ParseResult>> {
        self.parse_with_cache_cancellable(grammar, text, settings, use_cache, &CancellationToken::new())
            .await
    }

    /// [`ParserCache::parse_with_cache`] that stops compiling or parsing as
    /// soon as `cancel` fires, returning [`LiveError::Cancelled`].
    pub async fn parse_with_cache_cancellable(
        &self,
        grammar: &str,
        text: &str,
        settings: &ParseSettings,
        use_cache: bool,
        cancel: &CancellationToken,
    ) -> LiveResult<Arc<ParseResult>> {
        let started = Instant::now();
        let grammar_hash = grammar_key(grammar, settings);

        if let Some(error) = self.check_limits(grammar, Some(text), settings) {
            return Ok(Arc::new(ParseResult::failure(error, 0.0, grammar_hash)));
        }

        let key = result_key(grammar, text, settings);
        if use_cache {
            if let Some(hit) = self.results.lock().get(&key).cloned() {
                tracing::debug!(key = short(&key), "parse cache hit");
                // The result key ignores the debug flag; report the hash of
                // the settings actually requested.
                if hit.grammar_hash() != grammar_hash {
                    return Ok(Arc::new(hit.with_grammar_hash(grammar_hash)));
                }
                return Ok(hit);
            }
        }

        let result = match self.compiled_parser(grammar, settings, &grammar_hash, cancel).await? {
            Compiled::Failed(error) => ParseResult::failure(error, elapsed(started), grammar_hash),
            Compiled::Ready(parser) => self.run_parse(parser, text, started, grammar_hash, cancel).await?,
        };
        let result = Arc::new(result);

        if use_cache && result.status().is_deterministic() {
            self.results.lock().put(key, result.clone());
        }
        Ok(result)
    }

    async fn run_parse(
        &self,
        parser: Arc<dyn CompiledGrammar>,
        text: &str,
        started: Instant,
        grammar_hash: String,
        cancel: &CancellationToken,
    ) -> LiveResult<ParseResult> {
        let owned = text.to_string();
        let budget = Budget::with_timeout(self.max_parse_time);
        let outcome = self
            .pool
            .run_cancellable(self.max_parse_time, budget, cancel, move |budget| {
                parser
                    .parse(&owned, budget)
                    .map(|tree| AstNode::from(&tree))
                    .map_err(|failure| match failure {
                        ParseFailure::Interrupted => None,
                        other => Some(ErrorDetail::parse(&other, &owned)),
                    })
            })
            .await?;

        let result = match outcome {
            WorkOutcome::Done(Ok(tree)) => {
                self.parse_count.fetch_add(1, Ordering::Relaxed);
                ParseResult::success(tree, elapsed(started), grammar_hash)
            }
            WorkOutcome::Done(Err(Some(error))) => ParseResult::failure(error, elapsed(started), grammar_hash),
            WorkOutcome::Done(Err(None)) | WorkOutcome::TimedOut => {
                tracing::warn!(limit_s = self.max_parse_time.as_secs_f64(), "parse timed out");
                ParseResult::failure(ErrorDetail::timeout(), elapsed(started), grammar_hash)
            }
            WorkOutcome::Panicked(panic) => {
                tracing::error!(error = %panic, "parser worker panicked");
                ParseResult::failure(ErrorDetail::internal(), elapsed(started), grammar_hash)
            }
            WorkOutcome::Cancelled => return Err(LiveError::Cancelled),
        };
        Ok(result)
    }

    // ──────────────────────────────────────────────
    // Compilation
    // ──────────────────────────────────────────────

    /// Fetch or build the parser for `grammar` under `settings`.
    async fn compiled_parser(
        &self,
        grammar: &str,
        settings: &ParseSettings,
        key: &str,
        cancel: &CancellationToken,
    ) -> LiveResult<Compiled> {
        if let Some(parser) = self.compiled.lock().get(key).cloned() {
            return Ok(Compiled::Ready(parser));
        }

        let limit = self.max_parse_time / 2;
        let engine = self.engine.clone();
        let source = grammar.to_string();
        let options = CompileOptions {
            start: settings.start_rule.clone(),
            algorithm: settings.parser,
            debug: settings.debug,
        };
        let outcome = self
            .pool
            .run_cancellable(limit, Budget::with_timeout(limit), cancel, move |budget| {
                engine.compile(&source, &options, budget)
            })
            .await?;

        let compiled = match outcome {
            WorkOutcome::Done(Ok(parser)) => {
                self.store_compiled(key.to_string(), parser.clone());
                tracing::debug!(key = short(key), parser = %settings.parser, "compiled new parser");
                Compiled::Ready(parser)
            }
            WorkOutcome::Done(Err(CompileError::Grammar(error))) => {
                tracing::debug!(key = short(key), error = %error, "grammar rejected");
                Compiled::Failed(ErrorDetail::grammar(&error))
            }
            WorkOutcome::Done(Err(CompileError::Interrupted)) | WorkOutcome::TimedOut => {
                tracing::warn!(key = short(key), limit_s = limit.as_secs_f64(), "grammar compilation timed out");
                Compiled::Failed(ErrorDetail::timeout())
            }
            WorkOutcome::Panicked(panic) => {
                tracing::error!(key = short(key), error = %panic, "grammar compiler panicked");
                Compiled::Failed(ErrorDetail::internal())
            }
            WorkOutcome::Cancelled => return Err(LiveError::Cancelled),
        };
        Ok(compiled)
    }

    fn store_compiled(&self, key: String, parser: Arc<dyn CompiledGrammar>) {
        let mut compiled = self.compiled.lock();
        compiled.insert(key, parser);
        if compiled.len() > self.compiled_limit {
            truncate_oldest(&mut compiled, self.compiled_retain);
        }
    }

    /// Compile `grammar` and report whether it is usable.
    pub async fn validate_grammar(
        &self,
        grammar: &str,
        settings: &ParseSettings,
    ) -> LiveResult<ValidationResult> {
        if let Some(error) = self.check_limits(grammar, None, settings) {
            return Ok(ValidationResult::invalid(error));
        }
        let key = grammar_key(grammar, settings);
        let result = match self.compiled_parser(grammar, settings, &key, &CancellationToken::new()).await? {
            Compiled::Ready(parser) => ValidationResult::valid(
                parser.rule_count(),
                parser.terminal_count(),
                parser.warnings().to_vec(),
            ),
            Compiled::Failed(error) => ValidationResult::invalid(error),
        };
        Ok(result)
    }

    fn check_limits(&self, grammar: &str, text: Option<&str>, settings: &ParseSettings) -> Option<ErrorDetail> {
        if grammar.len() > self.max_grammar_size {
            return Some(ErrorDetail::validation(format!(
                "Grammar too large (max {} bytes)",
                self.max_grammar_size
            )));
        }
        if text.is_some_and(|t| t.len() > self.max_text_length) {
            return Some(ErrorDetail::validation(format!(
                "Text too large (max {} bytes)",
                self.max_text_length
            )));
        }
        settings
            .validate()
            .err()
            .map(|e| ErrorDetail::validation(e.to_string()))
    }

    // ──────────────────────────────────────────────
    // Maintenance
    // ──────────────────────────────────────────────

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            parse_count: self.parse_count.load(Ordering::Relaxed),
            cache_size: self.results.lock().len(),
            active_parsers: self.compiled.lock().len(),
            workers: self.pool.size(),
            busy_workers: self.pool.busy(),
        }
    }

    pub fn clear_result_cache(&self) {
        let mut results = self.results.lock();
        let dropped = results.len();
        results.clear();
        tracing::info!(dropped, "parse cache cleared");
    }

    /// Drop the oldest compiled parsers when over the limit.
    pub fn compact_compiled_parsers(&self) {
        let mut compiled = self.compiled.lock();
        if compiled.len() > self.compiled_limit {
            let before = compiled.len();
            truncate_oldest(&mut compiled, self.compiled_retain);
            tracing::info!(before, after = compiled.len(), "compiled parsers compacted");
        }
    }

    /// Stop accepting work. Parses in flight finish normally.
    pub fn close(&self) {
        self.pool.close();
    }
}

fn truncate_oldest(map: &mut IndexMap<String, Arc<dyn CompiledGrammar>>, retain: usize) {
    let excess = map.len().saturating_sub(retain);
    map.drain(..excess);
}

fn elapsed(started: Instant) -> f64 {
    started.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorType, ParseStatus};
    use larkline_grammar::{Algorithm, Tree};
    use std::sync::atomic::AtomicUsize;

    const ARITH: &str = r#"
        start: expr
        ?expr: expr "+" NUMBER | NUMBER
        %import common.NUMBER
        %import common.WS
        %ignore WS
    "#;

    fn config() -> LiveConfig {
        LiveConfig {
            worker_threads: 2,
            ..LiveConfig::default()
        }
    }

    /// Engine wrapper counting compile calls.
    struct Counting {
        compiles: AtomicUsize,
    }

    impl GrammarEngine for Counting {
        fn compile(
            &self,
            grammar: &str,
            options: &CompileOptions,
            budget: &Budget,
        ) -> Result<Arc<dyn CompiledGrammar>, CompileError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            LarkEngine.compile(grammar, options, budget)
        }
    }

    #[tokio::test]
    async fn parses_and_counts() {
        let cache = ParserCache::new(&config());
        let result = cache
            .parse_with_cache(ARITH, "1 + 2", &ParseSettings::default(), true)
            .await
            .unwrap();
        assert_eq!(result.status(), ParseStatus::Success);
        assert_eq!(result.tree().map(|t| t.label()), Some("start"));
        assert_eq!(result.grammar_hash(), grammar_key(ARITH, &ParseSettings::default()));

        let stats = cache.stats();
        assert_eq!(stats.parse_count, 1);
        assert_eq!(stats.cache_size, 1);
        assert_eq!(stats.active_parsers, 1);
        assert_eq!((stats.workers, stats.busy_workers), (2, 0));
    }

    #[tokio::test]
    async fn cache_hit_reports_hash_of_requested_settings() {
        let engine = Arc::new(Counting {
            compiles: AtomicUsize::new(0),
        });
        let cache = ParserCache::with_engine(&config(), engine.clone());
        let plain = ParseSettings::default();
        let debug = ParseSettings {
            debug: true,
            ..ParseSettings::default()
        };

        let first = cache.parse_with_cache(ARITH, "4", &plain, true).await.unwrap();
        let hit = cache.parse_with_cache(ARITH, "4", &debug, true).await.unwrap();

        assert_eq!(engine.compiles.load(Ordering::SeqCst), 1);
        assert_eq!(hit.tree(), first.tree());
        assert_eq!(hit.grammar_hash(), grammar_key(ARITH, &debug));
        assert_ne!(hit.grammar_hash(), first.grammar_hash());
    }

    #[tokio::test]
    async fn cancelled_parse_is_not_cached() {
        let cache = ParserCache::with_engine(&config(), Arc::new(BrokenEngine));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cache
            .parse_with_cache_cancellable("g", "t", &ParseSettings::default(), true, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, LiveError::Cancelled);
        assert_eq!(cache.stats().cache_size, 0);
        assert_eq!(cache.stats().active_parsers, 0);
    }

    #[tokio::test]
    async fn compiled_parser_is_reused_across_texts() {
        let engine = Arc::new(Counting {
            compiles: AtomicUsize::new(0),
        });
        let cache = ParserCache::with_engine(&config(), engine.clone());
        let settings = ParseSettings::default();

        cache.parse_with_cache(ARITH, "1", &settings, true).await.unwrap();
        cache.parse_with_cache(ARITH, "1 + 2", &settings, true).await.unwrap();
        let again = cache.parse_with_cache(ARITH, "1", &settings, true).await.unwrap();

        assert!(again.is_success());
        assert_eq!(engine.compiles.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().parse_count, 2);
    }

    #[tokio::test]
    async fn cache_hit_returns_the_stored_result() {
        let cache = ParserCache::new(&config());
        let settings = ParseSettings::default();
        let first = cache.parse_with_cache(ARITH, "3", &settings, true).await.unwrap();
        let second = cache.parse_with_cache(ARITH, "3", &settings, true).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let uncached = cache.parse_with_cache(ARITH, "3", &settings, false).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &uncached));
    }

    #[tokio::test]
    async fn oversized_input_is_rejected_without_work() {
        let engine = Arc::new(Counting {
            compiles: AtomicUsize::new(0),
        });
        let config = LiveConfig {
            max_text_length: 4,
            ..config()
        };
        let cache = ParserCache::with_engine(&config, engine.clone());
        let result = cache
            .parse_with_cache(ARITH, "1 + 2 + 3", &ParseSettings::default(), true)
            .await
            .unwrap();

        assert_eq!(result.status(), ParseStatus::InternalError);
        assert_eq!(result.error().map(|e| e.kind), Some(ErrorType::ValidationError));
        assert_eq!(engine.compiles.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().cache_size, 0);
    }

    #[tokio::test]
    async fn syntax_errors_carry_location() {
        let cache = ParserCache::new(&config());
        let result = cache
            .parse_with_cache(ARITH, "1 + + 2", &ParseSettings::default(), true)
            .await
            .unwrap();
        assert_eq!(result.status(), ParseStatus::ParseError);
        let error = result.error().unwrap();
        assert_eq!(error.kind, ErrorType::ParseError);
        assert_eq!(error.line, Some(1));
        assert!(error.column.is_some());
        assert!(error.context.as_deref().unwrap().contains('^'));
        // Deterministic failures are cached too.
        assert_eq!(cache.stats().cache_size, 1);
    }

    #[tokio::test]
    async fn grammar_errors_do_not_populate_compiled_map() {
        let cache = ParserCache::new(&config());
        let result = cache
            .parse_with_cache("start: missing", "x", &ParseSettings::default(), true)
            .await
            .unwrap();
        assert_eq!(result.status(), ParseStatus::InvalidGrammar);
        assert_eq!(cache.stats().active_parsers, 0);
    }

    #[tokio::test]
    async fn compiled_map_truncates_to_newest() {
        let config = LiveConfig {
            compiled_parser_limit: 3,
            compiled_parser_retain: 2,
            ..config()
        };
        let cache = ParserCache::new(&config);
        for n in 0..4 {
            let grammar = format!("start: \"{}\"", n);
            cache
                .validate_grammar(&grammar, &ParseSettings::default())
                .await
                .unwrap();
        }
        assert_eq!(cache.stats().active_parsers, 2);

        let compiled = cache.compiled.lock();
        let newest = grammar_key("start: \"3\"", &ParseSettings::default());
        assert!(compiled.contains_key(&newest));
    }

    #[tokio::test]
    async fn validation_reports_counts_and_errors() {
        let cache = ParserCache::new(&config());
        let valid = cache.validate_grammar(ARITH, &ParseSettings::default()).await.unwrap();
        assert!(valid.is_valid);
        assert!(valid.rule_count > 0);
        assert!(valid.terminal_count > 0);

        let invalid = cache
            .validate_grammar("start: undefined_rule", &ParseSettings::default())
            .await
            .unwrap();
        assert!(!invalid.is_valid);
        assert_eq!((invalid.rule_count, invalid.terminal_count), (0, 0));
        assert_eq!(invalid.errors[0].kind, ErrorType::GrammarError);
    }

    #[tokio::test]
    async fn debug_settings_surface_warnings() {
        let cache = ParserCache::new(&config());
        let settings = ParseSettings {
            debug: true,
            ..ParseSettings::default()
        };
        let result = cache
            .validate_grammar("start: \"a\"\nunused: \"b\"", &settings)
            .await
            .unwrap();
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("unused")));
    }

    #[tokio::test]
    async fn clear_and_close() {
        let cache = ParserCache::new(&config());
        let settings = ParseSettings {
            parser: Algorithm::Lalr,
            ..ParseSettings::default()
        };
        cache.parse_with_cache(ARITH, "7", &settings, true).await.unwrap();
        cache.clear_result_cache();
        cache.clear_result_cache();
        assert_eq!(cache.stats().cache_size, 0);

        cache.close();
        assert!(cache.parse_with_cache(ARITH, "8", &settings, true).await.is_err());
    }

    struct Broken;

    impl CompiledGrammar for Broken {
        fn parse(&self, _: &str, _: &Budget) -> Result<Tree, ParseFailure> {
            panic!("parser bug")
        }
        fn rule_count(&self) -> usize {
            0
        }
        fn terminal_count(&self) -> usize {
            0
        }
        fn warnings(&self) -> &[String] {
            &[]
        }
    }

    struct BrokenEngine;

    impl GrammarEngine for BrokenEngine {
        fn compile(&self, _: &str, _: &CompileOptions, _: &Budget) -> Result<Arc<dyn CompiledGrammar>, CompileError> {
            Ok(Arc::new(Broken))
        }
    }

    #[tokio::test]
    async fn worker_panic_becomes_internal_error() {
        let cache = ParserCache::with_engine(&config(), Arc::new(BrokenEngine));
        let result = cache
            .parse_with_cache("g", "t", &ParseSettings::default(), true)
            .await
            .unwrap();
        assert_eq!(result.status(), ParseStatus::InternalError);
        assert_eq!(result.error().unwrap().message, "Internal error while parsing");
        assert_eq!(cache.stats().cache_size, 0);
    }
}
