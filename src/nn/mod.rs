//! Neural network inference.
//!
//! Thin wrapper around [`tract-onnx`]. Networks are loaded from `.onnx` files on disk and run on
//! the CPU; inputs and outputs are `f32` [`ndarray`] arrays. Model-weight acquisition is not this
//! crate's concern.
//!
//! [`tract-onnx`]: https://github.com/sonos/tract

use std::{path::Path, sync::Arc};

use ndarray::ArrayD;
use tract_onnx::prelude::{
    Framework, Graph, InferenceModelExt, SimplePlan, TValue, TVec, Tensor, TypedFact, TypedOp,
};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Neural network loader.
pub struct Loader {
    model_data: Vec<u8>,
}

impl Loader {
    fn new(model_data: Vec<u8>) -> Self {
        Self { model_data }
    }

    /// Loads and optimizes the network.
    ///
    /// Returns an error if the network data is malformed or uses unimplemented operations.
    pub fn load(self) -> anyhow::Result<NeuralNetwork> {
        let model = tract_onnx::onnx()
            .model_for_read(&mut &*self.model_data)?
            .into_optimized()?
            .into_runnable()?;
        Ok(NeuralNetwork(Arc::new(model)))
    }
}

/// A neural network that can be used for inference.
///
/// This is a cheaply [`Clone`]able handle to the underlying network structures.
#[derive(Clone)]
pub struct NeuralNetwork(Arc<Model>);

impl NeuralNetwork {
    /// Loads a pre-trained model from an ONNX file path.
    ///
    /// The path must have a `.onnx` extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Loader> {
        Self::from_path_impl(path.as_ref())
    }

    fn from_path_impl(path: &Path) -> anyhow::Result<Loader> {
        match path.extension() {
            Some(ext) if ext == "onnx" => {}
            _ => anyhow::bail!("neural network file must have `.onnx` extension"),
        }

        let model_data = std::fs::read(path)?;
        Ok(Loader::new(model_data))
    }

    /// Loads a pre-trained model from an in-memory ONNX file.
    pub fn from_onnx(raw: &[u8]) -> Loader {
        Loader::new(raw.to_vec())
    }

    /// Runs the network on a set of input tensors, returning the estimated outputs.
    ///
    /// Outputs are returned in the network's output node order.
    #[doc(alias = "infer")]
    pub fn estimate(&self, inputs: &[ArrayD<f32>]) -> anyhow::Result<Vec<ArrayD<f32>>> {
        let inputs: TVec<TValue> = inputs
            .iter()
            .map(|t| TValue::from_const(Arc::new(Tensor::from(t.clone()))))
            .collect();
        let outputs = self.0.run(inputs)?;
        outputs
            .iter()
            .map(|t| Ok(t.to_array_view::<f32>()?.to_owned()))
            .collect()
    }
}
