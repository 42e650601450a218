pub mod codec;
pub mod config;
pub mod constants;
pub mod image;
pub mod machine;
pub mod runtime;
pub mod sync;

pub use self::{
    codec::{parse_instruction, Instruction},
    config::MachineConfig,
    image::load_image,
    machine::{HaltEvent, Machine, Status},
};
