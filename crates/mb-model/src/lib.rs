//! `mb-model` - model loading and inference-graph construction for model-bind.
//!
//! Three families share one lifecycle: [`ModelHandle::init`] loads a file
//! into a boxed container, [`ModelHandle::graph`] builds a fresh computation
//! graph borrowing it, and [`ModelHandle::uninit`] (or drop) releases it.
//!
//! | Family    | File format   | Container       |
//! |-----------|---------------|-----------------|
//! | [`Gpt2`]  | legacy GGML   | [`Gpt2Model`]   |
//! | [`Magika`]| GGUF          | [`MagikaModel`] |
//! | [`Yolo`]  | GGUF          | [`YoloContainer`] |

pub mod error;
pub mod family;
pub mod gguf;
pub mod gpt2;
pub mod handle;
pub mod legacy;
pub mod magika;
pub mod yolo;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

#[cfg(test)]
mod alloc_counter;

pub use error::{ModelError, Result};
pub use family::ModelFamily;
pub use gpt2::{Gpt2, Gpt2GraphParams, Gpt2Model, Gpt2Params};
pub use handle::ModelHandle;
pub use magika::{Magika, MagikaModel, MagikaParams};
pub use yolo::{Yolo, YoloContainer, YoloParams};

/// Handle for the GPT-2 text generator.
pub type TextModel = ModelHandle<Gpt2>;
/// Handle for the Magika file-type classifier.
pub type ClassifierModel = ModelHandle<Magika>;
/// Handle for the YOLOv3-tiny object detector.
pub type DetectorModel = ModelHandle<Yolo>;
