//! Append-only layer bookkeeping.
//!
//! Every successful step commits a new image on top of the previous one.
//! [`LayerStack`] records those (step, image) pairs. Its only mutator is
//! [`LayerStack::push`], and layers are only ever handed out by shared
//! reference, so a recorded layer cannot be altered once committed.

use serde::Serialize;

use crate::error::EnvstrapError;
use crate::image::ImageId;
use crate::step::Step;

/// An immutable layer produced by one provisioning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layer {
    step: Step,
    image: ImageId,
}

impl Layer {
    pub fn step(&self) -> Step {
        self.step
    }

    pub fn image(&self) -> &ImageId {
        &self.image
    }
}

/// Ordered, append-only list of committed layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LayerStack {
    layers: Vec<Layer>,
}

impl LayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the layer committed by `step`.
    ///
    /// Steps must be pushed in strictly increasing order, starting with
    /// [`Step::ResolveBase`].
    pub fn push(&mut self, step: Step, image: ImageId) -> Result<&Layer, EnvstrapError> {
        match self.top() {
            None if step != Step::ResolveBase => {
                return Err(EnvstrapError::Validation(format!(
                    "first layer must come from {}, got {}",
                    Step::ResolveBase,
                    step
                )));
            }
            Some(top) if top.step >= step => {
                return Err(EnvstrapError::Validation(format!(
                    "layer for {} cannot be stacked on top of {}",
                    step, top.step
                )));
            }
            _ => {}
        }

        tracing::debug!(step = %step, image = %image, "layer committed");
        self.layers.push(Layer { step, image });
        Ok(&self.layers[self.layers.len() - 1])
    }

    /// The most recently committed layer.
    pub fn top(&self) -> Option<&Layer> {
        self.layers.last()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Layer> {
        self.layers.iter()
    }
}

impl<'a> IntoIterator for &'a LayerStack {
    type Item = &'a Layer;
    type IntoIter = std::slice::Iter<'a, Layer>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
