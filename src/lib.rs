//! # docent
//!
//! Ask questions about a PDF document and get answers from a hosted LLM,
//! grounded only in that document.
//!
//! Every turn builds a system instruction from a fixed persona, a set of
//! answering rules, and the document context, then sends the user's
//! question to the model. The context is either the whole extracted text
//! of the PDF or, in retrieval mode, the top-k chunks of a precomputed
//! similarity index.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────┐   ┌────────────┐
//! │   PDF    │──▶│  Extract    │──▶│   Prompt     │──▶│ Generator  │
//! │ (cached) │   │ (full text) │   │  Assembler   │   │ Gemini/OAI │
//! └──────────┘   └─────────────┘   └──────▲───────┘   └─────┬──────┘
//!                                         │                 │ stream
//! ┌──────────┐   ┌─────────────┐          │           ┌─────▼──────┐
//! │  Index   │──▶│  Retriever  │──────────┘           │ Postprocess│
//! │ (SQLite) │   │   (top-k)   │                      └─────┬──────┘
//! └──────────┘   └─────────────┘                            ▼
//!                                                   CLI REPL / HTTP SSE
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export GOOGLE_API_KEY=...
//! docent extract --pdf manual.pdf        # check the text that will be used
//! docent ask "기초연금 신청 방법은?"        # one question
//! docent chat                            # interactive session
//! docent serve                           # HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`secrets`] | API key loading |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`extract`] | PDF text extraction and cache |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Precomputed similarity index |
//! | [`retrieve`] | Top-k retrieval |
//! | [`prompt`] | System instruction assembly |
//! | [`generation`] | Hosted LLM clients and answer streams |
//! | [`postprocess`] | Streamed fragment rewrites |
//! | [`session`] | Conversation state and the chat turn |
//! | [`chat`] | CLI front-ends |
//! | [`server`] | HTTP server |

pub mod chat;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod index;
pub mod models;
pub mod postprocess;
pub mod prompt;
pub mod retrieve;
pub mod secrets;
pub mod server;
pub mod session;
