use std::cell::{Cell, OnceCell, RefCell};
use std::pin::Pin;

use bumpalo::Bump;

use crate::errors::Result;
use crate::model::{
	Field, FieldAttributes, Method, MethodAttributes, MethodImplAttributes, StackType, Type, TypeAttributes,
};
use crate::utilities::check;

pub const CORELIB_NAME: &str = "Corelib";
pub const CORELIB_VERSION: u16 = 1;

/// The types every assembly can rely on: the corelib universe the loader
/// would otherwise produce, plus the exception types the translator throws.
#[derive(Debug)]
pub struct WellKnown<'l> {
	pub object: &'l Type<'l>,
	pub value_type: &'l Type<'l>,
	pub enum_type: &'l Type<'l>,
	pub array: &'l Type<'l>,
	pub string: &'l Type<'l>,
	pub type_type: &'l Type<'l>,
	pub boolean: &'l Type<'l>,
	pub char: &'l Type<'l>,
	pub sbyte: &'l Type<'l>,
	pub byte: &'l Type<'l>,
	pub int16: &'l Type<'l>,
	pub uint16: &'l Type<'l>,
	pub int32: &'l Type<'l>,
	pub uint32: &'l Type<'l>,
	pub int64: &'l Type<'l>,
	pub uint64: &'l Type<'l>,
	pub single: &'l Type<'l>,
	pub double: &'l Type<'l>,
	pub intptr: &'l Type<'l>,
	pub uintptr: &'l Type<'l>,
	pub exception: &'l Type<'l>,
	pub arithmetic_exception: &'l Type<'l>,
	pub divide_by_zero_exception: &'l Type<'l>,
	pub execution_engine_exception: &'l Type<'l>,
	pub index_out_of_range_exception: &'l Type<'l>,
	pub null_reference_exception: &'l Type<'l>,
	pub invalid_cast_exception: &'l Type<'l>,
	pub out_of_memory_exception: &'l Type<'l>,
	pub overflow_exception: &'l Type<'l>,
}

impl<'l> WellKnown<'l> {
	pub fn runtime_exceptions(&self) -> [&'l Type<'l>; 8] {
		[
			self.arithmetic_exception,
			self.divide_by_zero_exception,
			self.execution_engine_exception,
			self.index_out_of_range_exception,
			self.null_reference_exception,
			self.invalid_cast_exception,
			self.out_of_memory_exception,
			self.overflow_exception,
		]
	}
}

/// Owns the universe of types for the lifetime of the process. Types are
/// arena-allocated and never freed; every inter-type link is a non-owning
/// reference tied to the registry's lifetime.
pub struct TypeRegistry<'l> {
	bump: Pin<Box<Bump>>,
	types: RefCell<Vec<&'l Type<'l>>>,
	well_known: OnceCell<WellKnown<'l>>,
}

impl<'l> TypeRegistry<'l> {
	pub fn new() -> Self {
		Self {
			bump: Pin::new(Box::new(Bump::new())),
			types: RefCell::new(vec![]),
			well_known: OnceCell::new(),
		}
	}

	#[inline]
	pub(crate) fn bump(&self) -> &'l Bump {
		unsafe { std::mem::transmute(&*self.bump) }
	}

	#[inline]
	pub fn intern_str(&self, str: &str) -> &'l str {
		self.bump().alloc_str(str)
	}

	#[inline]
	pub fn intern_bytes(&self, bytes: &[u8]) -> &'l [u8] {
		self.bump().alloc_slice_copy(bytes)
	}

	/// A snapshot of every type the registry currently owns, in handle
	/// order. Embedders use this to bind type symbols for linking.
	pub fn types(&self) -> Vec<&'l Type<'l>> {
		self.types.borrow().clone()
	}

	/// The registry handle backing a type's exported symbol value.
	pub fn type_by_id(&self, id: u32) -> Option<&'l Type<'l>> {
		self.types.borrow().get(id as usize).copied()
	}

	pub fn well_known(&'l self) -> &'l WellKnown<'l> {
		self.well_known.get_or_init(|| self.create_well_known())
	}

	fn register(&self, ty: &'l Type<'l>) -> &'l Type<'l> {
		let mut types = self.types.borrow_mut();
		ty.id.set(types.len() as u32);
		types.push(ty);
		ty
	}

	/// Allocates a blank type in the arena. The loader fills in layout,
	/// members and links afterwards.
	pub fn define_type(
		&'l self,
		assembly_name: &str,
		assembly_major_version: u16,
		namespace: &str,
		name: &str,
		attributes: TypeAttributes,
	) -> &'l Type<'l> {
		let bump = self.bump();
		self.register(bump.alloc(Type {
			id: Cell::new(0),
			name: bump.alloc_str(name),
			namespace: bump.alloc_str(namespace),
			assembly_name: bump.alloc_str(assembly_name),
			assembly_major_version,
			declaring_type: Cell::new(None),
			base_type: Cell::new(None),
			element_type: Cell::new(None),
			array_type: Cell::new(None),
			by_ref_type: Cell::new(None),
			generic_type_definition: Cell::new(None),
			next_generic_instance: Cell::new(None),
			generic_arguments: Cell::new(&[]),
			generic_parameter_position: Cell::new(None),
			attributes: Cell::new(attributes),
			is_value_type: Cell::new(false),
			is_array: Cell::new(false),
			is_by_ref: Cell::new(false),
			stack_type: Cell::new(StackType::O),
			stack_size: Cell::new(8),
			managed_size: Cell::new(0),
			stack_alignment: Cell::new(8),
			managed_alignment: Cell::new(8),
			fields: RefCell::new(vec![]),
			methods: RefCell::new(vec![]),
			virtual_methods: RefCell::new(vec![]),
			interface_impls: RefCell::new(vec![]),
			managed_pointers_offsets: RefCell::new(vec![]),
			vtable: RefCell::new(vec![]),
		}))
	}

	pub fn define_field(
		&'l self,
		name: &str,
		field_type: &'l Type<'l>,
		attributes: FieldAttributes,
	) -> &'l Field<'l> {
		let bump = self.bump();
		bump.alloc(Field {
			name: bump.alloc_str(name),
			declaring_type: Cell::new(None),
			field_type: Cell::new(field_type),
			attributes: Cell::new(attributes),
			memory_offset: Cell::new(0),
		})
	}

	pub fn define_method(
		&'l self,
		name: &str,
		return_type: Option<&'l Type<'l>>,
		parameters: &[&'l Type<'l>],
		attributes: MethodAttributes,
		impl_attributes: MethodImplAttributes,
	) -> &'l Method<'l> {
		let bump = self.bump();
		bump.alloc(Method {
			name: bump.alloc_str(name),
			declaring_type: Cell::new(None),
			return_type: Cell::new(return_type),
			parameters: RefCell::new(parameters.to_vec()),
			attributes: Cell::new(attributes),
			impl_attributes: Cell::new(impl_attributes),
			vtable_offset: Cell::new(None),
			body: RefCell::new(None),
			mir_func: Cell::new(None),
			func_addr: Cell::new(None),
		})
	}

	fn create_well_known(&'l self) -> WellKnown<'l> {
		let class = |namespace: &str, name: &str, managed_size: u32| {
			let ty = self.define_type(CORELIB_NAME, CORELIB_VERSION, namespace, name, TypeAttributes::from_bits_retain(1));
			ty.managed_size.set(managed_size);
			ty
		};
		let primitive = |name: &str, size: u32, stack_type: StackType| {
			let ty = self.define_type(CORELIB_NAME, CORELIB_VERSION, "System", name, TypeAttributes::from_bits_retain(1));
			ty.is_value_type.set(true);
			ty.stack_type.set(stack_type);
			ty.stack_size.set(size);
			ty.managed_size.set(size);
			ty.stack_alignment.set(size);
			ty.managed_alignment.set(size);
			ty
		};

		// the object header is a vtable word plus a gc word; arrays put their
		// length right after it
		let object = class("System", "Object", 16);
		let value_type = class("System", "ValueType", 16);
		let enum_type = class("System", "Enum", 16);
		let array = class("System", "Array", 24);
		let string = class("System", "String", 24);
		let type_type = class("System", "Type", 16);
		value_type.base_type.set(Some(object));
		enum_type.base_type.set(Some(value_type));
		array.base_type.set(Some(object));
		string.base_type.set(Some(object));
		type_type.base_type.set(Some(object));

		let boolean = primitive("Boolean", 1, StackType::Int32);
		let char = primitive("Char", 2, StackType::Int32);
		let sbyte = primitive("SByte", 1, StackType::Int32);
		let byte = primitive("Byte", 1, StackType::Int32);
		let int16 = primitive("Int16", 2, StackType::Int32);
		let uint16 = primitive("UInt16", 2, StackType::Int32);
		let int32 = primitive("Int32", 4, StackType::Int32);
		let uint32 = primitive("UInt32", 4, StackType::Int32);
		let int64 = primitive("Int64", 8, StackType::Int64);
		let uint64 = primitive("UInt64", 8, StackType::Int64);
		let single = primitive("Single", 4, StackType::Float);
		let double = primitive("Double", 8, StackType::Float);
		let intptr = primitive("IntPtr", 8, StackType::IntPtr);
		let uintptr = primitive("UIntPtr", 8, StackType::IntPtr);
		for ty in [boolean, char, sbyte, byte, int16, uint16, int32, uint32, int64, uint64, single, double, intptr, uintptr] {
			ty.base_type.set(Some(value_type));
		}

		let exception = class("System", "Exception", 16);
		exception.base_type.set(Some(object));

		let exception_class = |name: &str| {
			let ty = class("System", name, 16);
			ty.base_type.set(Some(exception));
			let ctor = self.define_method(
				".ctor",
				None,
				&[],
				MethodAttributes::from_bits_retain(6)
					| MethodAttributes::SPECIAL_NAME
					| MethodAttributes::RT_SPECIAL_NAME,
				MethodImplAttributes::INTERNAL_CALL,
			);
			ctor.declaring_type.set(Some(ty));
			ty.methods.borrow_mut().push(ctor);
			ty
		};

		WellKnown {
			object,
			value_type,
			enum_type,
			array,
			string,
			type_type,
			boolean,
			char,
			sbyte,
			byte,
			int16,
			uint16,
			int32,
			uint32,
			int64,
			uint64,
			single,
			double,
			intptr,
			uintptr,
			exception,
			arithmetic_exception: exception_class("ArithmeticException"),
			divide_by_zero_exception: exception_class("DivideByZeroException"),
			execution_engine_exception: exception_class("ExecutionEngineException"),
			index_out_of_range_exception: exception_class("IndexOutOfRangeException"),
			null_reference_exception: exception_class("NullReferenceException"),
			invalid_cast_exception: exception_class("InvalidCastException"),
			out_of_memory_exception: exception_class("OutOfMemoryException"),
			overflow_exception: exception_class("OverflowException"),
		}
	}

	//------------------------------------------------------------------------------------------------------------------
	// Derived types
	//------------------------------------------------------------------------------------------------------------------

	/// The unique array type with element `ty`; created on first request.
	/// Racing derivations re-check the per-type cell after allocating and
	/// drop the losing copy.
	pub fn array_type_of(&'l self, ty: &'l Type<'l>) -> &'l Type<'l> {
		if let Some(existing) = ty.array_type.get() {
			return existing;
		}

		let wk = self.well_known();
		let name = format!("{}[]", ty.name);
		let array = self.define_type(
			ty.assembly_name,
			ty.assembly_major_version,
			ty.namespace,
			&name,
			TypeAttributes::from_bits_retain(1),
		);
		array.is_array.set(true);
		array.base_type.set(Some(wk.array));
		array.element_type.set(Some(ty));
		array.stack_type.set(StackType::O);
		array.stack_size.set(wk.array.stack_size.get());
		array.managed_size.set(wk.array.managed_size.get());
		array.stack_alignment.set(wk.array.stack_alignment.get());
		array.managed_alignment.set(wk.array.managed_alignment.get());
		// same vtable shape as System.Array
		*array.virtual_methods.borrow_mut() = wk.array.virtual_methods.borrow().clone();
		*array.vtable.borrow_mut() = vec![None; wk.array.vtable.borrow().len()];

		if let Some(existing) = ty.array_type.get() {
			return existing;
		}
		ty.array_type.set(Some(array));
		array
	}

	fn derive_by_ref(&'l self, ty: &'l Type<'l>) -> &'l Type<'l> {
		if let Some(existing) = ty.by_ref_type.get() {
			return existing;
		}

		let name = format!("{}&", ty.name);
		let by_ref = self.define_type(
			ty.assembly_name,
			ty.assembly_major_version,
			ty.namespace,
			&name,
			TypeAttributes::from_bits_retain(1),
		);
		by_ref.is_by_ref.set(true);
		by_ref.base_type.set(Some(ty));
		by_ref.stack_type.set(StackType::Ref);
		by_ref.stack_size.set(8);
		by_ref.managed_size.set(ty.stack_size.get());
		by_ref.stack_alignment.set(8);
		by_ref.managed_alignment.set(ty.stack_alignment.get());

		if let Some(existing) = ty.by_ref_type.get() {
			return existing;
		}
		ty.by_ref_type.set(Some(by_ref));
		by_ref
	}

	/// The unique managed-reference type over `ty`. Deriving a by-ref of a
	/// by-ref is invalid CIL.
	pub fn by_ref_type_of(&'l self, ty: &'l Type<'l>) -> Result<&'l Type<'l>> {
		check!(!ty.is_by_ref.get());
		Ok(self.derive_by_ref(ty))
	}

	//------------------------------------------------------------------------------------------------------------------
	// Verifier type lattices
	//------------------------------------------------------------------------------------------------------------------

	pub fn is_enum(&'l self, ty: &'l Type<'l>) -> bool {
		ty.base_type.get() == Some(self.well_known().enum_type)
	}

	pub fn is_integer(&'l self, ty: &'l Type<'l>) -> bool {
		let wk = self.well_known();
		[
			wk.byte, wk.int16, wk.int32, wk.int64, wk.sbyte, wk.uint16, wk.uint32, wk.uint64, wk.uintptr,
			wk.intptr, wk.char, wk.boolean,
		]
		.contains(&ty)
	}

	/// An enum's storage type; any other type is its own underlying type.
	pub fn underlying_type(&'l self, ty: &'l Type<'l>) -> &'l Type<'l> {
		match self.is_enum(ty) {
			true => ty.element_type.get().unwrap_or(ty),
			false => ty,
		}
	}

	/// Collapses unsigned onto signed at each width, and UIntPtr onto IntPtr.
	pub fn reduced_type(&'l self, ty: &'l Type<'l>) -> &'l Type<'l> {
		let wk = self.well_known();
		let ty = self.underlying_type(ty);
		match ty {
			t if t == wk.byte => wk.sbyte,
			t if t == wk.uint16 => wk.int16,
			t if t == wk.uint32 => wk.int32,
			t if t == wk.uint64 => wk.int64,
			t if t == wk.uintptr => wk.intptr,
			t => t,
		}
	}

	/// The reduced type with Boolean folded onto SByte and Char onto Int16;
	/// by-ref structure is preserved.
	pub fn verification_type(&'l self, ty: &'l Type<'l>) -> &'l Type<'l> {
		let wk = self.well_known();
		let ty = self.reduced_type(ty);
		match ty {
			t if t == wk.boolean => wk.sbyte,
			t if t == wk.char => wk.int16,
			t if t.is_by_ref.get() => {
				let base = t.base_type.get().unwrap_or(t);
				self.derive_by_ref(self.verification_type(base))
			}
			t => t,
		}
	}

	/// The verification type widened to the operand-stack width.
	pub fn intermediate_type(&'l self, ty: &'l Type<'l>) -> &'l Type<'l> {
		let wk = self.well_known();
		let ty = self.verification_type(ty);
		match ty {
			t if t == wk.sbyte || t == wk.int16 => wk.int32,
			t => t,
		}
	}

	fn direct_base_class(&'l self, ty: &'l Type<'l>) -> Option<&'l Type<'l>> {
		let wk = self.well_known();
		if ty.is_array.get() {
			Some(wk.array)
		} else if ty.is_object_ref() || ty.is_interface() {
			Some(wk.object)
		} else if ty.is_value_type.get() {
			Some(wk.value_type)
		} else {
			None
		}
	}

	fn is_interface_directly_implemented_by(&'l self, interface: &'l Type<'l>, ty: &'l Type<'l>) -> bool {
		interface.is_interface() && ty.interface_impl(interface).is_some()
	}

	/// ECMA-335 I.8.7.1 type compatibility.
	pub fn is_compatible_with(&'l self, t: &'l Type<'l>, u: &'l Type<'l>) -> bool {
		if t == u {
			return true;
		}

		if t.is_object_ref() {
			if self.direct_base_class(t) == Some(u) {
				return true;
			}
			if self.is_interface_directly_implemented_by(u, t) {
				return true;
			}
		}

		if !t.is_value_type.get() {
			let mut base = t.base_type.get();
			while let Some(ty) = base {
				if ty == u {
					return true;
				}
				base = ty.base_type.get();
			}
		}

		if t.is_array.get() && u.is_array.get() {
			let (Some(te), Some(ue)) = (t.element_type.get(), u.element_type.get()) else {
				return false;
			};
			if self.is_array_element_compatible_with(te, ue) {
				return true;
			}
		}

		if t.is_by_ref.get() && u.is_by_ref.get() && self.is_pointer_element_compatible_with(t, u) {
			return true;
		}

		false
	}

	/// Array covariance works over verification-type equivalence so that
	/// e.g. `bool[]` and `int8[]` stores interoperate.
	pub fn is_array_element_compatible_with(&'l self, t: &'l Type<'l>, u: &'l Type<'l>) -> bool {
		let v = self.underlying_type(t);
		let w = self.underlying_type(u);
		self.is_compatible_with(v, w) || self.verification_type(v) == self.verification_type(w)
	}

	pub fn is_pointer_element_compatible_with(&'l self, t: &'l Type<'l>, u: &'l Type<'l>) -> bool {
		self.verification_type(t) == self.verification_type(u)
	}

	fn is_assignable_to(&'l self, t: Option<&'l Type<'l>>, u: Option<&'l Type<'l>>) -> bool {
		if t == u {
			return true;
		}

		match (t, u) {
			(Some(t), Some(u)) => {
				if self.intermediate_type(t) == self.intermediate_type(u) {
					return true;
				}
				self.is_compatible_with(t, u)
			}
			// the all-zero null reference is assignable to any reference type
			(None, Some(u)) => u.is_object_ref(),
			_ => false,
		}
	}

	/// ECMA-335 III.1.8.1.2.3, over the verification-type lattice. `None`
	/// stands for the type of the null reference.
	pub fn is_verifier_assignable_to(&'l self, q: Option<&'l Type<'l>>, r: Option<&'l Type<'l>>) -> bool {
		let t = q.map(|ty| self.verification_type(ty));
		let u = r.map(|ty| self.verification_type(ty));
		t == u || self.is_assignable_to(t, u)
	}

	//------------------------------------------------------------------------------------------------------------------
	// Generic instantiation
	//------------------------------------------------------------------------------------------------------------------

	fn is_generic_definition(&self, ty: &'l Type<'l>) -> bool {
		!ty.generic_arguments.get().is_empty() && ty.generic_type_definition.get().is_none()
	}

	fn expand_type(&'l self, ty: &'l Type<'l>, arguments: &'l [&'l Type<'l>]) -> &'l Type<'l> {
		if let Some(position) = ty.generic_parameter_position.get() {
			return arguments[position as usize];
		}
		if !self.is_generic_definition(ty) {
			return ty;
		}

		// scan the existing instances, publishing double-checked
		let mut instance = ty.next_generic_instance.get();
		while let Some(existing) = instance {
			if existing.generic_arguments.get() == arguments {
				return existing;
			}
			instance = existing.next_generic_instance.get();
		}

		let real_instance = arguments.iter().all(|arg| arg.generic_parameter_position.get().is_none());

		let mut name = format!("{}<", ty.name);
		for (i, argument) in arguments.iter().enumerate() {
			match i + 1 == arguments.len() {
				true => name.push_str(&argument.to_string()),
				false => {
					name.push_str(&argument.to_string());
					name.push(',');
				}
			}
		}
		name.push('>');

		let instance = self.define_type(
			ty.assembly_name,
			ty.assembly_major_version,
			ty.namespace,
			&name,
			ty.attributes.get(),
		);
		instance.declaring_type.set(ty.declaring_type.get());
		instance.generic_type_definition.set(Some(ty));
		instance.generic_arguments.set(arguments);
		instance.is_value_type.set(ty.is_value_type.get());
		instance.stack_type.set(ty.stack_type.get());
		instance.stack_size.set(ty.stack_size.get());
		instance.managed_size.set(ty.managed_size.get());
		instance.stack_alignment.set(ty.stack_alignment.get());
		instance.managed_alignment.set(ty.managed_alignment.get());
		if let Some(base) = ty.base_type.get() {
			instance.base_type.set(Some(self.expand_type(base, arguments)));
		}

		let fields: Vec<_> = ty
			.fields
			.borrow()
			.iter()
			.map(|field| {
				let expanded = self.define_field(
					field.name,
					self.expand_type(field.field_type.get(), arguments),
					field.attributes.get(),
				);
				expanded.declaring_type.set(Some(instance));
				expanded.memory_offset.set(field.memory_offset.get());
				expanded
			})
			.collect();
		*instance.fields.borrow_mut() = fields;

		let methods: Vec<_> = ty
			.methods
			.borrow()
			.iter()
			.map(|method| {
				let parameters: Vec<_> = method
					.parameters
					.borrow()
					.iter()
					.map(|parameter| self.expand_type(parameter, arguments))
					.collect();
				let expanded = self.define_method(
					method.name,
					method.return_type.get().map(|ty| self.expand_type(ty, arguments)),
					&parameters,
					method.attributes.get(),
					method.impl_attributes.get(),
				);
				expanded.declaring_type.set(Some(instance));
				expanded.vtable_offset.set(method.vtable_offset.get());
				*expanded.body.borrow_mut() = method.body.borrow().clone();
				expanded
			})
			.collect();
		*instance.methods.borrow_mut() = methods;

		if real_instance {
			instance.next_generic_instance.set(ty.next_generic_instance.get());
			ty.next_generic_instance.set(Some(instance));
		}

		instance
	}

	/// Expands a generic definition over concrete arguments, reusing an
	/// existing instance when one matches.
	pub fn instantiate(&'l self, ty: &'l Type<'l>, arguments: &[&'l Type<'l>]) -> Result<&'l Type<'l>> {
		check!(self.is_generic_definition(ty));
		check!(ty.generic_arguments.get().len() == arguments.len());
		let arguments = self.bump().alloc_slice_copy(arguments);
		Ok(self.expand_type(ty, arguments))
	}
}

impl Default for TypeRegistry<'_> {
	fn default() -> Self {
		Self::new()
	}
}
