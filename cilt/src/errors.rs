/// The error kinds visible at the JIT boundary.
///
/// Every intermediate helper propagates one of these with `?`; the top-level
/// [`compile_assembly`](crate::jit::compile_assembly) call surfaces the first
/// failure and drops the half-built module so no partial code can execute.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum JitError {
	/// The verifier rejected the CIL, or an internal consistency check failed.
	CheckFailed,
	/// An unresolved token, symbol or vtable slot.
	NotFound,
	/// A malformed signature or method body.
	BadFormat,
	/// The backend ran out of resources.
	OutOfResources,
}

pub type Result<T> = std::result::Result<T, JitError>;
