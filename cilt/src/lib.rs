//! An experimental JIT for ECMA-335 CIL assemblies. The loader hands over a
//! fully-populated type graph; methods are verified by abstract
//! interpretation of the operand stack while they are lowered into a
//! MIR-style backend module, which is then linked lazily into the shared
//! [`mir::CodeContext`].
//!
//! The garbage collector, the heap and the machine-code generator proper
//! live behind narrow contracts: the runtime helper symbols emitted code
//! calls (`gc_new`, `gc_update`, `gc_update_ref`, `isinstance`,
//! `dynamic_cast_obj_to_interface`, `get_array_type`, `managed_memcpy`,
//! `managed_ref_memcpy`, `memcpy`, `memset`) and the [`jit::JitRuntime`]
//! services used while a module is finalised.

pub mod errors;
pub mod il;
pub mod jit;
pub mod metadata_token;
pub mod mir;
pub mod model;
pub mod registry;

pub(crate) mod utilities;

pub use errors::{JitError, Result};
pub use jit::{compile_assembly, JitRuntime};
