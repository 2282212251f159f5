//! Repository analysis: discovery, parsing, import graph, summaries and
//! capability flows. Pure functions over snapshot files and artifacts; the
//! pipeline handlers decide when each runs and where results are stored.

pub mod capabilities;
pub mod discover;
pub mod files;
pub mod graph;
pub mod models;
pub mod parser;
pub mod summarize;

pub use capabilities::{build_capabilities, lane_for_path};
pub use discover::{discover, language_for, tree_payload};
pub use files::{file_blurb, merge_batches, parse_batch};
pub use graph::{build_graph, ImportResolver, ImportsMetrics};
pub use models::*;
pub use parser::{create_parser, FileParser, HeuristicParser, ProjectContext, SubprocessParser};
pub use summarize::{
    create_summarizer, summarize_files, FileContext, HeuristicSummarizer, LlmSummarizer, Summarizer,
};
