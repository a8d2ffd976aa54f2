//! # autodoc
//!
//! Incremental, LLM-driven analysis of a source tree into a searchable
//! knowledge base.
//!
//! Each source file is sent to an analysis service that returns a
//! structured description (summary, functions, types, dependencies). The
//! description is split into documents and stored for keyword search. Only
//! files whose content changed since the last run are re-analyzed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────┐   ┌─────────┐   ┌─────────┐
//! │  Walker  │──▶│  Pipeline  │──▶│ Batcher  │──▶│ Analyzer│──▶│   LLM   │
//! │ FileRecs │   │ state+deps │   │ N slots  │   │ retries │   │provider │
//! └──────────┘   └─────┬──────┘   └──────────┘   └─────────┘   └─────────┘
//!                      │ chunk
//!                      ▼
//!                ┌────────────┐
//!                │   Store    │  memory (JSON) or SQLite FTS5
//!                └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! autodoc cost                  # estimate what indexing would cost
//! autodoc index                 # analyze changed files
//! autodoc update                # also follow dependencies and drop deleted files
//! autodoc search "redis cache"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Core data types |
//! | [`config`] | TOML configuration parsing |
//! | [`state`] | Persisted content hashes and analyses snapshot |
//! | [`deps`] | Change-set expansion through declared dependencies |
//! | [`llm`] | Completion provider abstraction and rate limiting |
//! | [`prompts`] | Analysis prompts per quality tier |
//! | [`analyzer`] | Retrying analysis with response repair |
//! | [`batcher`] | Bounded-concurrency batch runner with circuit breaker |
//! | [`chunk`] | Analysis → document conversion |
//! | [`store`] | Document storage backends |
//! | [`cost`] | Token and cost estimation |
//! | [`pipeline`] | Run orchestration |
//! | [`walker`] | Filesystem scanning |
//! | [`progress`] | Progress reporting on stderr |
//! | [`search`] | Keyword search command |

pub mod analyzer;
pub mod batcher;
pub mod chunk;
pub mod config;
pub mod cost;
pub mod deps;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod search;
pub mod state;
pub mod store;
pub mod walker;
