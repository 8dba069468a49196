//! latgen-cli: command-line driver for the latgen streaming decoder.

pub mod cli;
pub mod decode;
pub mod info;
