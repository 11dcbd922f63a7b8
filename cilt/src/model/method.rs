use std::cell::{Cell, RefCell};
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use crate::mir::{FuncAddr, MirItemId};
use crate::model::types::{impl_identity, MemberAccess, MethodAttributes, MethodImplAttributes, Type};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MethodCodeType {
	Il,
	Native,
	Runtime,
}

/// A method as produced by the loader, plus the back-pointers the JIT fills
/// in once the method's code has been emitted and linked.
#[derive(Debug)]
pub struct Method<'l> {
	pub name: &'l str,
	pub declaring_type: Cell<Option<&'l Type<'l>>>,
	/// `None` for void.
	pub return_type: Cell<Option<&'l Type<'l>>>,
	pub parameters: RefCell<Vec<&'l Type<'l>>>,
	pub attributes: Cell<MethodAttributes>,
	pub impl_attributes: Cell<MethodImplAttributes>,
	/// Slot in the declaring type's virtual method table.
	pub vtable_offset: Cell<Option<u32>>,
	pub body: RefCell<Option<MethodBody<'l>>>,

	/// The emitted function item inside the assembly's module.
	pub(crate) mir_func: Cell<Option<MirItemId>>,
	/// The linked address, available after module finalise.
	pub(crate) func_addr: Cell<Option<FuncAddr>>,
}

impl<'l> Method<'l> {
	#[inline]
	pub fn is_static(&self) -> bool {
		self.attributes.get().contains(MethodAttributes::STATIC)
	}

	#[inline]
	pub fn is_virtual(&self) -> bool {
		self.attributes.get().contains(MethodAttributes::VIRTUAL)
	}

	#[inline]
	pub fn is_abstract(&self) -> bool {
		self.attributes.get().contains(MethodAttributes::ABSTRACT)
	}

	#[inline]
	pub fn is_final(&self) -> bool {
		self.attributes.get().contains(MethodAttributes::FINAL)
	}

	#[inline]
	pub fn is_special_name(&self) -> bool {
		self.attributes.get().contains(MethodAttributes::SPECIAL_NAME)
	}

	#[inline]
	pub fn is_rt_special_name(&self) -> bool {
		self.attributes.get().contains(MethodAttributes::RT_SPECIAL_NAME)
	}

	#[inline]
	pub fn is_internal_call(&self) -> bool {
		self.impl_attributes.get().contains(MethodImplAttributes::INTERNAL_CALL)
	}

	#[inline]
	pub fn is_unmanaged(&self) -> bool {
		self.impl_attributes.get().contains(MethodImplAttributes::UNMANAGED)
	}

	#[inline]
	pub fn is_aggressive_inlining(&self) -> bool {
		self.impl_attributes.get().contains(MethodImplAttributes::AGGRESSIVE_INLINING)
	}

	pub fn code_type(&self) -> MethodCodeType {
		match (self.impl_attributes.get() & MethodImplAttributes::CODE_TYPE_MASK).bits() {
			0 => MethodCodeType::Il,
			3 => MethodCodeType::Runtime,
			_ => MethodCodeType::Native,
		}
	}

	pub fn access(&self) -> MemberAccess {
		MemberAccess::from_bits((self.attributes.get() & MethodAttributes::ACCESS_MASK).bits())
	}

	/// The emitted function item, set while the method is being translated.
	#[inline]
	pub fn mir_func(&self) -> Option<MirItemId> {
		self.mir_func.get()
	}

	/// The resolved function address, set by the module finaliser.
	#[inline]
	pub fn func_addr(&self) -> Option<FuncAddr> {
		self.func_addr.get()
	}
}

impl Display for Method<'_> {
	/// The symbol name of the method:
	/// `[Assembly-vN]Type::Name(param,..)`.
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if let Some(declaring) = self.declaring_type.get() {
			write!(f, "{}::", declaring)?;
		}
		write!(f, "{}(", self.name)?;
		let parameters = self.parameters.borrow();
		for (i, parameter) in parameters.iter().enumerate() {
			match i + 1 == parameters.len() {
				true => write!(f, "{}", parameter)?,
				false => write!(f, "{},", parameter)?,
			}
		}
		write!(f, ")")
	}
}

impl_identity!(Method);

#[derive(Debug, Clone)]
pub struct MethodBody<'l> {
	pub max_stack: u16,
	pub init_locals: bool,
	pub locals: Vec<&'l Type<'l>>,
	pub code: &'l [u8],
	pub exception_clauses: Vec<ExceptionClause<'l>>,
}

#[derive(Debug, Copy, Clone)]
pub enum ClauseKind<'l> {
	Catch(&'l Type<'l>),
	Finally,
	Fault,
	/// Recognised but rejected by the translator.
	Filter { filter_offset: u32 },
}

#[derive(Debug, Copy, Clone)]
pub struct ExceptionClause<'l> {
	pub kind: ClauseKind<'l>,
	pub try_offset: u32,
	pub try_length: u32,
	pub handler_offset: u32,
	pub handler_length: u32,
}

impl<'l> ExceptionClause<'l> {
	#[inline]
	pub fn try_contains(&self, il_offset: u32) -> bool {
		self.try_offset <= il_offset && il_offset < self.try_offset + self.try_length
	}

	#[inline]
	pub fn handler_contains(&self, il_offset: u32) -> bool {
		self.handler_offset <= il_offset && il_offset < self.handler_offset + self.handler_length
	}

	#[inline]
	pub fn catch_type(&self) -> Option<&'l Type<'l>> {
		match self.kind {
			ClauseKind::Catch(ty) => Some(ty),
			_ => None,
		}
	}
}
