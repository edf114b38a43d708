//! Vector quantization index families (spec §4.4.6, §4.4.7): memory-reduced
//! representations traded against a bounded recall loss.

mod binary;
mod product;

pub use binary::{BinaryQuantizationIndex, BinaryQuantizedVector};
pub use product::ProductQuantizationIndex;

use super::{IndexEntry, SearchIndex};
