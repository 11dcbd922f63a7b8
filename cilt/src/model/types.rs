use std::cell::{Cell, RefCell};
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use bitflags::bitflags;
use derivative::Derivative;

use crate::mir::FuncAddr;
use crate::model::method::Method;

/// Offset of the virtual-function slots inside a runtime vtable. The first
/// word of a vtable is the owning type handle.
pub const VTABLE_VIRTUAL_FUNCTIONS_OFFSET: i64 = 8;

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct TypeAttributes: u32 {
		const VISIBILITY_MASK = 0x0000_0007;
		const INTERFACE = 0x0000_0020;
		const ABSTRACT = 0x0000_0080;
		const SEALED = 0x0000_0100;
		const SPECIAL_NAME = 0x0000_0400;
		const RT_SPECIAL_NAME = 0x0000_0800;
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct FieldAttributes: u16 {
		const ACCESS_MASK = 0x0007;
		const STATIC = 0x0010;
		const INIT_ONLY = 0x0020;
		const LITERAL = 0x0040;
		const SPECIAL_NAME = 0x0200;
		const RT_SPECIAL_NAME = 0x0400;
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodAttributes: u16 {
		const ACCESS_MASK = 0x0007;
		const STATIC = 0x0010;
		const FINAL = 0x0020;
		const VIRTUAL = 0x0040;
		const HIDE_BY_SIG = 0x0080;
		const ABSTRACT = 0x0400;
		const SPECIAL_NAME = 0x0800;
		const RT_SPECIAL_NAME = 0x1000;
	}
}

bitflags! {
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodImplAttributes: u16 {
		const CODE_TYPE_MASK = 0x0003;
		const CODE_TYPE_IL = 0x0000;
		const CODE_TYPE_NATIVE = 0x0001;
		const CODE_TYPE_RUNTIME = 0x0003;
		const UNMANAGED = 0x0004;
		const AGGRESSIVE_INLINING = 0x0100;
		const INTERNAL_CALL = 0x1000;
	}
}

/// The categories the verifier reasons in. Concrete types collapse onto one
/// of these before any stack rule is applied.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StackType {
	Int32,
	Int64,
	IntPtr,
	Float,
	/// An object reference, including the two-word interface form.
	O,
	/// A managed pointer.
	Ref,
	ValueType,
}

/// An entry in a type's interface implementation table. `vtable_offset` is
/// the base of the interface's slot slice inside the implementing type's
/// virtual method table.
#[derive(Debug, Copy, Clone)]
pub struct InterfaceImpl<'l> {
	pub interface_type: &'l Type<'l>,
	pub vtable_offset: u32,
}

/// A type as produced by the loader and derived by the registry. All
/// inter-type links are non-owning references into the registry arena;
/// late-bound links use interior mutability so the cyclic graph can be tied
/// after allocation.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Type<'l> {
	pub(crate) id: Cell<u32>,
	pub name: &'l str,
	pub namespace: &'l str,
	pub assembly_name: &'l str,
	pub assembly_major_version: u16,

	#[derivative(Debug = "ignore")]
	pub declaring_type: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub base_type: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub element_type: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub array_type: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub by_ref_type: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub generic_type_definition: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub next_generic_instance: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug = "ignore")]
	pub generic_arguments: Cell<&'l [&'l Type<'l>]>,
	pub generic_parameter_position: Cell<Option<u32>>,

	pub attributes: Cell<TypeAttributes>,
	pub is_value_type: Cell<bool>,
	pub is_array: Cell<bool>,
	pub is_by_ref: Cell<bool>,
	pub stack_type: Cell<StackType>,

	pub stack_size: Cell<u32>,
	pub managed_size: Cell<u32>,
	pub stack_alignment: Cell<u32>,
	pub managed_alignment: Cell<u32>,

	#[derivative(Debug = "ignore")]
	pub fields: RefCell<Vec<&'l Field<'l>>>,
	#[derivative(Debug = "ignore")]
	pub methods: RefCell<Vec<&'l Method<'l>>>,
	#[derivative(Debug = "ignore")]
	pub virtual_methods: RefCell<Vec<&'l Method<'l>>>,
	#[derivative(Debug = "ignore")]
	pub interface_impls: RefCell<Vec<InterfaceImpl<'l>>>,

	/// Sorted byte offsets of managed references inside a value type.
	pub managed_pointers_offsets: RefCell<Vec<u32>>,

	/// Virtual-function slots, patched once the module is finalised.
	#[derivative(Debug = "ignore")]
	pub vtable: RefCell<Vec<Option<FuncAddr>>>,
}

impl<'l> Type<'l> {
	/// Registry-assigned handle, stable for the life of the process. Emitted
	/// type symbols are bound to this value.
	#[inline]
	pub fn id(&self) -> u32 {
		self.id.get()
	}

	#[inline]
	pub fn is_interface(&self) -> bool {
		self.attributes.get().contains(TypeAttributes::INTERFACE)
	}

	#[inline]
	pub fn is_abstract(&self) -> bool {
		self.attributes.get().contains(TypeAttributes::ABSTRACT)
	}

	/// True for anything the runtime tracks as an object reference,
	/// interfaces included.
	#[inline]
	pub fn is_object_ref(&self) -> bool {
		self.stack_type.get() == StackType::O
	}

	pub fn visibility(&self) -> TypeVisibility {
		match (self.attributes.get() & TypeAttributes::VISIBILITY_MASK).bits() {
			0 => TypeVisibility::NotPublic,
			1 => TypeVisibility::Public,
			2 => TypeVisibility::NestedPublic,
			3 => TypeVisibility::NestedPrivate,
			4 => TypeVisibility::NestedFamily,
			5 => TypeVisibility::NestedAssembly,
			6 => TypeVisibility::NestedFamilyAndAssembly,
			_ => TypeVisibility::NestedFamilyOrAssembly,
		}
	}

	/// Walks the transitive base chain, `self` included.
	pub fn base_chain(&'l self) -> impl Iterator<Item = &'l Type<'l>> {
		let mut next = Some(self);
		std::iter::from_fn(move || {
			let current = next?;
			next = current.base_type.get();
			Some(current)
		})
	}

	pub fn find_field(&self, name: &str) -> Option<&'l Field<'l>> {
		self.fields.borrow().iter().copied().find(|f| f.name == name)
	}

	pub fn find_method(&self, name: &str) -> Option<&'l Method<'l>> {
		self.methods.borrow().iter().copied().find(|m| m.name == name)
	}

	/// Looks up the implementation entry for `interface_type` on this
	/// concrete type.
	pub fn interface_impl(&self, interface_type: &'l Type<'l>) -> Option<InterfaceImpl<'l>> {
		self.interface_impls
			.borrow()
			.iter()
			.copied()
			.find(|impl_| std::ptr::eq(impl_.interface_type, interface_type))
	}

	/// Resolves an interface-declared method to the virtual method occupying
	/// its slot on this concrete type.
	pub fn interface_method_impl(&self, method: &'l Method<'l>) -> Option<&'l Method<'l>> {
		let declaring = method.declaring_type.get()?;
		let impl_ = self.interface_impl(declaring)?;
		let slot = impl_.vtable_offset + method.vtable_offset.get()?;
		self.virtual_methods.borrow().get(slot as usize).copied()
	}
}

impl Display for Type<'_> {
	/// The canonical assembly-qualified name under which the type is
	/// exported: `[Assembly-vN]Namespace.Name`, nested types joined by `+`.
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.generic_parameter_position.get().is_some() {
			return write!(f, "{}", self.name);
		}
		write!(f, "[{}-v{}]", self.assembly_name, self.assembly_major_version)?;
		fmt_type_name(self, f)
	}
}

pub(crate) fn fmt_type_name(ty: &Type, f: &mut Formatter<'_>) -> std::fmt::Result {
	if let Some(declaring) = ty.declaring_type.get() {
		fmt_type_name(declaring, f)?;
		write!(f, "+")?;
	} else if !ty.namespace.is_empty() {
		write!(f, "{}.", ty.namespace)?;
	}
	write!(f, "{}", ty.name)
}

#[derive(Debug)]
pub struct Field<'l> {
	pub name: &'l str,
	pub declaring_type: Cell<Option<&'l Type<'l>>>,
	pub field_type: Cell<&'l Type<'l>>,
	pub attributes: Cell<FieldAttributes>,
	/// Byte offset inside the owning object, unused for statics.
	pub memory_offset: Cell<u32>,
}

impl<'l> Field<'l> {
	#[inline]
	pub fn is_static(&self) -> bool {
		self.attributes.get().contains(FieldAttributes::STATIC)
	}

	#[inline]
	pub fn is_init_only(&self) -> bool {
		self.attributes.get().contains(FieldAttributes::INIT_ONLY)
	}

	pub fn access(&self) -> MemberAccess {
		MemberAccess::from_bits((self.attributes.get() & FieldAttributes::ACCESS_MASK).bits())
	}
}

impl Display for Field<'_> {
	/// The symbol name of the field's static storage:
	/// `[Assembly-vN]Type::Name`.
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self.declaring_type.get() {
			Some(declaring) => write!(f, "{}::{}", declaring, self.name),
			None => write!(f, "{}", self.name),
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TypeVisibility {
	NotPublic,
	Public,
	NestedPublic,
	NestedPrivate,
	NestedFamily,
	NestedAssembly,
	NestedFamilyAndAssembly,
	NestedFamilyOrAssembly,
}

/// Field and method accessibility share the same three-bit encoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemberAccess {
	CompilerControlled,
	Private,
	FamilyAndAssembly,
	Assembly,
	Family,
	FamilyOrAssembly,
	Public,
}

impl MemberAccess {
	pub(crate) fn from_bits(bits: u16) -> Self {
		match bits {
			0 => MemberAccess::CompilerControlled,
			1 => MemberAccess::Private,
			2 => MemberAccess::FamilyAndAssembly,
			3 => MemberAccess::Assembly,
			4 => MemberAccess::Family,
			5 => MemberAccess::FamilyOrAssembly,
			_ => MemberAccess::Public,
		}
	}
}

macro_rules! impl_identity {
    ($($ty: ident),*) => {
		$(
			impl Eq for $ty<'_> {}

			impl PartialEq<Self> for $ty<'_> {
				#[inline]
				fn eq(&self, other: &Self) -> bool {
					std::ptr::eq(self, other)
				}
			}

			impl Hash for $ty<'_> {
				fn hash<H: Hasher>(&self, state: &mut H) {
					(self as *const Self).hash(state)
				}
			}
		)*
	};
}

impl_identity!(Type, Field);

pub(crate) use impl_identity;
