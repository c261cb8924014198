//! Prompt generation for the protogen pipeline.
//!
//! Maps a [`DeliverableKind`], the user's idea and the outputs of earlier
//! stages to the prompt text sent to the inference server. Rendering is pure:
//! the same inputs always produce the same prompt.

mod error;
mod kind;
mod manager;
mod template;

pub use error::PmError;
pub use kind::{DeliverableKind, normalize_input};
pub use manager::PromptManager;
pub use template::{PriorStage, PromptTemplate};
