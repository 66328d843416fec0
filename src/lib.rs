//! Ask-me-anything over documents: a retrieval core plus cross-context chat
//! orchestration.
//!
//! The crate is split along the context boundaries of the system it powers:
//! the UI, the router and the worker share no memory and exchange only
//! [`protocol::Envelope`] values. The worker side owns the retrieval engine
//! ([`splitter`], [`vector_store`], [`rag_pipeline`]), the stored sessions and
//! the streaming chat loop; the [`router`] owns tab tracking and output
//! buffering. Model access, fetching and text extraction are external
//! collaborators behind the traits in [`model`].

pub mod chat_streamer;
pub mod errors;
pub mod model;
pub mod protocol;
pub mod rag_pipeline;
pub mod router;
pub mod session_store;
pub mod splitter;
pub mod vector_store;
pub mod worker;

pub use errors::AmaError;
