//! Shared fixture for the end-to-end tests: a small IL assembler, a builder
//! for loader-shaped assemblies, and a reference evaluator that executes the
//! emitted backend IR against a simulated heap with native hooks for the
//! runtime helpers.

#![allow(dead_code)]

use std::collections::HashMap;

use cilt::jit::JitRuntime;
use cilt::metadata_token::{MetadataToken, MetadataTokenKind};
use cilt::mir::{CodeContext, FuncAddr, LinkedModule, MirFunc, MirInsnCode, MirItem, MirMemOp, MirOp, MirType};
use cilt::model::{
	Assembly, ExceptionClause, Field, FieldAttributes, ImportedMember, InterfaceImpl, Method, MethodAttributes,
	MethodBody, MethodImplAttributes, StackType, Type, TypeAttributes,
};
use cilt::registry::TypeRegistry;

pub fn public_class() -> TypeAttributes {
	TypeAttributes::from_bits_retain(1)
}

pub fn public_static_method() -> MethodAttributes {
	MethodAttributes::from_bits_retain(6) | MethodAttributes::STATIC
}

pub fn public_instance_method() -> MethodAttributes {
	MethodAttributes::from_bits_retain(6)
}

pub fn public_virtual_method() -> MethodAttributes {
	MethodAttributes::from_bits_retain(6) | MethodAttributes::VIRTUAL
}

pub fn public_field() -> FieldAttributes {
	FieldAttributes::from_bits_retain(6)
}

pub fn public_static_field() -> FieldAttributes {
	FieldAttributes::from_bits_retain(6) | FieldAttributes::STATIC
}

//----------------------------------------------------------------------------------------------------------------------
// IL assembler
//----------------------------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone)]
pub struct Label(usize);

struct Fixup {
	at: usize,
	base: usize,
	label: Label,
}

/// Assembles CIL bytes with label fixups. Branch displacements are relative
/// to the next instruction; `switch` entries are relative to the end of the
/// whole table.
#[derive(Default)]
pub struct Il {
	bytes: Vec<u8>,
	fixups: Vec<Fixup>,
	marks: Vec<Option<u32>>,
}

impl Il {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn label(&mut self) -> Label {
		self.marks.push(None);
		Label(self.marks.len() - 1)
	}

	pub fn mark(&mut self, label: Label) {
		self.marks[label.0] = Some(self.bytes.len() as u32);
	}

	pub fn offset(&self) -> u32 {
		self.bytes.len() as u32
	}

	pub fn offset_of(&self, label: Label) -> u32 {
		self.marks[label.0].expect("label was never marked")
	}

	fn op(&mut self, byte: u8) -> &mut Self {
		self.bytes.push(byte);
		self
	}

	fn token(&mut self, token: MetadataToken) -> &mut Self {
		self.bytes.extend_from_slice(&token.raw().to_le_bytes());
		self
	}

	fn branch_target(&mut self, label: Label) -> &mut Self {
		let at = self.bytes.len();
		self.bytes.extend_from_slice(&[0; 4]);
		self.fixups.push(Fixup { at, base: at + 4, label });
		self
	}

	pub fn nop(&mut self) -> &mut Self {
		self.op(0x00)
	}

	pub fn ldarg(&mut self, index: u8) -> &mut Self {
		match index {
			0..=3 => self.op(0x02 + index),
			_ => self.op(0x0E).op(index),
		}
	}

	pub fn ldloc(&mut self, index: u8) -> &mut Self {
		match index {
			0..=3 => self.op(0x06 + index),
			_ => self.op(0x11).op(index),
		}
	}

	pub fn stloc(&mut self, index: u8) -> &mut Self {
		match index {
			0..=3 => self.op(0x0A + index),
			_ => self.op(0x13).op(index),
		}
	}

	pub fn ldloca(&mut self, index: u8) -> &mut Self {
		self.op(0x12).op(index)
	}

	pub fn ldnull(&mut self) -> &mut Self {
		self.op(0x14)
	}

	pub fn ldc_i4(&mut self, value: i32) -> &mut Self {
		self.op(0x20);
		self.bytes.extend_from_slice(&value.to_le_bytes());
		self
	}

	pub fn ldc_i8(&mut self, value: i64) -> &mut Self {
		self.op(0x21);
		self.bytes.extend_from_slice(&value.to_le_bytes());
		self
	}

	pub fn ldc_r4(&mut self, value: f32) -> &mut Self {
		self.op(0x22);
		self.bytes.extend_from_slice(&value.to_le_bytes());
		self
	}

	pub fn ldc_r8(&mut self, value: f64) -> &mut Self {
		self.op(0x23);
		self.bytes.extend_from_slice(&value.to_le_bytes());
		self
	}

	pub fn dup(&mut self) -> &mut Self {
		self.op(0x25)
	}

	pub fn pop(&mut self) -> &mut Self {
		self.op(0x26)
	}

	pub fn call(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x28).token(token)
	}

	pub fn callvirt(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x6F).token(token)
	}

	pub fn newobj(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x73).token(token)
	}

	pub fn ret(&mut self) -> &mut Self {
		self.op(0x2A)
	}

	pub fn add(&mut self) -> &mut Self {
		self.op(0x58)
	}

	pub fn sub(&mut self) -> &mut Self {
		self.op(0x59)
	}

	pub fn mul(&mut self) -> &mut Self {
		self.op(0x5A)
	}

	pub fn div(&mut self) -> &mut Self {
		self.op(0x5B)
	}

	pub fn rem(&mut self) -> &mut Self {
		self.op(0x5D)
	}

	pub fn shl(&mut self) -> &mut Self {
		self.op(0x62)
	}

	pub fn neg(&mut self) -> &mut Self {
		self.op(0x65)
	}

	pub fn conv_i8(&mut self) -> &mut Self {
		self.op(0x6A)
	}

	pub fn conv_r8(&mut self) -> &mut Self {
		self.op(0x6C)
	}

	pub fn br(&mut self, label: Label) -> &mut Self {
		self.op(0x38).branch_target(label)
	}

	pub fn brfalse(&mut self, label: Label) -> &mut Self {
		self.op(0x39).branch_target(label)
	}

	pub fn brtrue(&mut self, label: Label) -> &mut Self {
		self.op(0x3A).branch_target(label)
	}

	pub fn blt(&mut self, label: Label) -> &mut Self {
		self.op(0x3F).branch_target(label)
	}

	pub fn br_s(&mut self, displacement: i8) -> &mut Self {
		self.op(0x2B).op(displacement as u8)
	}

	pub fn brtrue_s(&mut self, displacement: i8) -> &mut Self {
		self.op(0x2D).op(displacement as u8)
	}

	pub fn switch(&mut self, labels: &[Label]) -> &mut Self {
		self.op(0x45);
		self.bytes.extend_from_slice(&(labels.len() as u32).to_le_bytes());
		let base = self.bytes.len() + labels.len() * 4;
		for &label in labels {
			let at = self.bytes.len();
			self.bytes.extend_from_slice(&[0; 4]);
			self.fixups.push(Fixup { at, base, label });
		}
		self
	}

	pub fn ldstr(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x72).token(token)
	}

	pub fn castclass(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x74).token(token)
	}

	pub fn isinst(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x75).token(token)
	}

	pub fn throw(&mut self) -> &mut Self {
		self.op(0x7A)
	}

	pub fn ldfld(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x7B).token(token)
	}

	pub fn ldflda(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x7C).token(token)
	}

	pub fn stfld(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x7D).token(token)
	}

	pub fn ldsfld(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x7E).token(token)
	}

	pub fn ldsflda(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x7F).token(token)
	}

	pub fn stsfld(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x80).token(token)
	}

	pub fn box_value(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x8C).token(token)
	}

	pub fn unbox_any(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0xA5).token(token)
	}

	pub fn newarr(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0x8D).token(token)
	}

	pub fn ldlen(&mut self) -> &mut Self {
		self.op(0x8E)
	}

	pub fn ldelem_i4(&mut self) -> &mut Self {
		self.op(0x94)
	}

	pub fn stelem_i4(&mut self) -> &mut Self {
		self.op(0x9E)
	}

	pub fn stelem_ref(&mut self) -> &mut Self {
		self.op(0xA2)
	}

	pub fn ldelem_ref(&mut self) -> &mut Self {
		self.op(0x9A)
	}

	pub fn leave(&mut self, label: Label) -> &mut Self {
		self.op(0xDD).branch_target(label)
	}

	pub fn endfinally(&mut self) -> &mut Self {
		self.op(0xDC)
	}

	pub fn ceq(&mut self) -> &mut Self {
		self.op(0xFE).op(0x01)
	}

	pub fn clt(&mut self) -> &mut Self {
		self.op(0xFE).op(0x04)
	}

	pub fn initobj(&mut self, token: MetadataToken) -> &mut Self {
		self.op(0xFE).op(0x15).token(token)
	}

	/// Applies the fixups and interns the body bytes in the registry arena.
	pub fn assemble<'l>(mut self, registry: &'l TypeRegistry<'l>) -> AssembledIl<'l> {
		for fixup in &self.fixups {
			let target = self.marks[fixup.label.0].expect("label was never marked");
			let displacement = target as i64 - fixup.base as i64;
			self.bytes[fixup.at..fixup.at + 4].copy_from_slice(&(displacement as i32).to_le_bytes());
		}
		AssembledIl { code: registry.intern_bytes(&self.bytes), marks: self.marks }
	}
}

pub struct AssembledIl<'l> {
	pub code: &'l [u8],
	marks: Vec<Option<u32>>,
}

impl<'l> AssembledIl<'l> {
	pub fn offset_of(&self, label: Label) -> u32 {
		self.marks[label.0].expect("label was never marked")
	}
}

//----------------------------------------------------------------------------------------------------------------------
// Assembly fixture
//----------------------------------------------------------------------------------------------------------------------

/// Builds the loader-shaped `Assembly` the compiler consumes: types with
/// computed layouts, vtables, interface tables, and token-addressable
/// member lists.
pub struct AssemblyFixture<'l> {
	pub registry: &'l TypeRegistry<'l>,
	name: String,
	defined_types: Vec<&'l Type<'l>>,
	defined_methods: Vec<&'l Method<'l>>,
	defined_fields: Vec<&'l Field<'l>>,
	imported_types: Vec<&'l Type<'l>>,
	imported_members: Vec<ImportedMember<'l>>,
	user_strings: Vec<(u32, &'l str)>,
}

impl<'l> AssemblyFixture<'l> {
	pub fn new(registry: &'l TypeRegistry<'l>, name: &str) -> Self {
		Self {
			registry,
			name: name.to_string(),
			defined_types: vec![],
			defined_methods: vec![],
			defined_fields: vec![],
			imported_types: vec![],
			imported_members: vec![],
			user_strings: vec![],
		}
	}

	pub fn class(&mut self, namespace: &str, name: &str) -> &'l Type<'l> {
		let wk = self.registry.well_known();
		self.class_extending(namespace, name, wk.object)
	}

	pub fn class_extending(&mut self, namespace: &str, name: &str, base: &'l Type<'l>) -> &'l Type<'l> {
		let ty = self.registry.define_type(&self.name, 1, namespace, name, public_class());
		ty.base_type.set(Some(base));
		ty.managed_size.set(base.managed_size.get());
		// derived types start from the base's dispatch surface
		*ty.virtual_methods.borrow_mut() = base.virtual_methods.borrow().clone();
		*ty.vtable.borrow_mut() = vec![None; base.virtual_methods.borrow().len()];
		self.defined_types.push(ty);
		ty
	}

	pub fn struct_type(&mut self, namespace: &str, name: &str) -> &'l Type<'l> {
		let wk = self.registry.well_known();
		let ty = self.registry.define_type(&self.name, 1, namespace, name, public_class());
		ty.base_type.set(Some(wk.value_type));
		ty.is_value_type.set(true);
		ty.stack_type.set(StackType::ValueType);
		ty.stack_size.set(0);
		ty.managed_size.set(0);
		self.defined_types.push(ty);
		ty
	}

	pub fn interface(&mut self, namespace: &str, name: &str) -> &'l Type<'l> {
		let attributes = public_class() | TypeAttributes::INTERFACE | TypeAttributes::ABSTRACT;
		let ty = self.registry.define_type(&self.name, 1, namespace, name, attributes);
		// an interface value is a two-word slot on the stack
		ty.stack_size.set(16);
		self.defined_types.push(ty);
		ty
	}

	pub fn import_type(&mut self, ty: &'l Type<'l>) -> MetadataToken {
		if let Some(index) = self.imported_types.iter().position(|t| *t == ty) {
			return MetadataToken::new(MetadataTokenKind::TypeRef, index + 1);
		}
		self.imported_types.push(ty);
		MetadataToken::new(MetadataTokenKind::TypeRef, self.imported_types.len())
	}

	pub fn import_method(&mut self, method: &'l Method<'l>) -> MetadataToken {
		self.imported_members.push(ImportedMember::Method(method));
		MetadataToken::new(MetadataTokenKind::MemberRef, self.imported_members.len())
	}

	pub fn field(&mut self, ty: &'l Type<'l>, name: &str, field_type: &'l Type<'l>) -> &'l Field<'l> {
		let field = self.registry.define_field(name, field_type, public_field());
		field.declaring_type.set(Some(ty));

		let align = field_type.stack_alignment.get().max(1);
		let offset = (ty.managed_size.get() + align - 1) & !(align - 1);
		field.memory_offset.set(offset);
		ty.managed_size.set(offset + field_type.stack_size.get());
		if ty.is_value_type.get() {
			ty.stack_size.set(ty.managed_size.get());
			if field_type.is_object_ref() {
				ty.managed_pointers_offsets.borrow_mut().push(offset);
			}
		}

		ty.fields.borrow_mut().push(field);
		self.defined_fields.push(field);
		field
	}

	pub fn static_field(&mut self, ty: &'l Type<'l>, name: &str, field_type: &'l Type<'l>) -> &'l Field<'l> {
		let field = self.registry.define_field(name, field_type, public_static_field());
		field.declaring_type.set(Some(ty));
		ty.fields.borrow_mut().push(field);
		self.defined_fields.push(field);
		field
	}

	pub fn method(
		&mut self,
		ty: &'l Type<'l>,
		name: &str,
		return_type: Option<&'l Type<'l>>,
		parameters: &[&'l Type<'l>],
		attributes: MethodAttributes,
	) -> &'l Method<'l> {
		let method = self
			.registry
			.define_method(name, return_type, parameters, attributes, MethodImplAttributes::empty());
		method.declaring_type.set(Some(ty));
		ty.methods.borrow_mut().push(method);
		self.defined_methods.push(method);
		method
	}

	pub fn ctor(&mut self, ty: &'l Type<'l>) -> &'l Method<'l> {
		let attributes = public_instance_method()
			| MethodAttributes::SPECIAL_NAME
			| MethodAttributes::RT_SPECIAL_NAME;
		let ctor = self.method(ty, ".ctor", None, &[], attributes);
		let mut il = Il::new();
		il.ret();
		let body = il.assemble(self.registry);
		self.set_body(ctor, 1, &[], body.code, vec![]);
		ctor
	}

	/// Declares a virtual method; overriding a base method by name reuses
	/// its slot, anything else appends a new one.
	pub fn virtual_method(
		&mut self,
		ty: &'l Type<'l>,
		name: &str,
		return_type: Option<&'l Type<'l>>,
		parameters: &[&'l Type<'l>],
	) -> &'l Method<'l> {
		let method = self.method(ty, name, return_type, parameters, public_virtual_method());

		let slot = ty.virtual_methods.borrow().iter().position(|m| m.name == name);
		match slot {
			Some(slot) => {
				method.vtable_offset.set(Some(slot as u32));
				ty.virtual_methods.borrow_mut()[slot] = method;
			}
			None => {
				let slot = ty.virtual_methods.borrow().len() as u32;
				method.vtable_offset.set(Some(slot));
				ty.virtual_methods.borrow_mut().push(method);
			}
		}
		ty.vtable.borrow_mut().resize(ty.virtual_methods.borrow().len(), None);
		method
	}

	pub fn interface_method(
		&mut self,
		interface: &'l Type<'l>,
		name: &str,
		return_type: Option<&'l Type<'l>>,
		parameters: &[&'l Type<'l>],
	) -> &'l Method<'l> {
		let attributes = public_virtual_method() | MethodAttributes::ABSTRACT;
		let method = self.method(interface, name, return_type, parameters, attributes);
		let slot = interface.virtual_methods.borrow().len() as u32;
		method.vtable_offset.set(Some(slot));
		interface.virtual_methods.borrow_mut().push(method);
		method
	}

	/// Records an interface implementation: the interface's slots are
	/// appended to the type's vtable in interface declaration order, bound
	/// to the implementing methods by name.
	pub fn implement(&mut self, ty: &'l Type<'l>, interface: &'l Type<'l>) {
		let vtable_offset = ty.virtual_methods.borrow().len() as u32;
		for declared in interface.virtual_methods.borrow().iter() {
			let implementation = ty.find_method(declared.name).expect("missing interface method");
			ty.virtual_methods.borrow_mut().push(implementation);
		}
		ty.vtable.borrow_mut().resize(ty.virtual_methods.borrow().len(), None);
		ty.interface_impls
			.borrow_mut()
			.push(InterfaceImpl { interface_type: interface, vtable_offset });
	}

	pub fn set_body(
		&mut self,
		method: &'l Method<'l>,
		max_stack: u16,
		locals: &[&'l Type<'l>],
		code: &'l [u8],
		exception_clauses: Vec<ExceptionClause<'l>>,
	) {
		*method.body.borrow_mut() = Some(MethodBody {
			max_stack,
			init_locals: true,
			locals: locals.to_vec(),
			code,
			exception_clauses,
		});
	}

	pub fn set_uninitialised_body(&mut self, method: &'l Method<'l>, locals: &[&'l Type<'l>], code: &'l [u8]) {
		*method.body.borrow_mut() = Some(MethodBody {
			max_stack: 8,
			init_locals: false,
			locals: locals.to_vec(),
			code,
			exception_clauses: vec![],
		});
	}

	pub fn user_string(&mut self, value: &str) -> MetadataToken {
		let key = self.user_strings.len() as u32 + 1;
		self.user_strings.push((key, self.registry.intern_str(value)));
		MetadataToken::new(MetadataTokenKind::UserString, key as usize)
	}

	pub fn type_token(&self, ty: &'l Type<'l>) -> MetadataToken {
		if let Some(index) = self.defined_types.iter().position(|t| *t == ty) {
			return MetadataToken::new(MetadataTokenKind::TypeDef, index + 1);
		}
		let index = self.imported_types.iter().position(|t| *t == ty).expect("type not declared");
		MetadataToken::new(MetadataTokenKind::TypeRef, index + 1)
	}

	pub fn method_token(&self, method: &'l Method<'l>) -> MetadataToken {
		let index = self.defined_methods.iter().position(|m| *m == method).expect("method not declared");
		MetadataToken::new(MetadataTokenKind::MethodDef, index + 1)
	}

	pub fn field_token(&self, field: &'l Field<'l>) -> MetadataToken {
		let index = self.defined_fields.iter().position(|f| *f == field).expect("field not declared");
		MetadataToken::new(MetadataTokenKind::Field, index + 1)
	}

	pub fn build(self) -> Assembly<'l> {
		let name = self.registry.intern_str(&self.name);
		let mut assembly = Assembly {
			name,
			major_version: 1,
			defined_types: self.defined_types,
			imported_types: self.imported_types,
			defined_methods: self.defined_methods,
			defined_fields: self.defined_fields,
			imported_members: self.imported_members,
			user_strings: Default::default(),
		};
		for (key, value) in self.user_strings {
			assembly.user_strings.insert(key, value);
		}
		assembly
	}
}

//----------------------------------------------------------------------------------------------------------------------
// Host runtime
//----------------------------------------------------------------------------------------------------------------------

const STRING_BASE: u64 = 0x6000_0000;

/// The embedder services the finaliser needs: GC roots and user-string
/// objects.
#[derive(Default)]
pub struct Host {
	pub roots: Vec<u64>,
	pub strings: Vec<(u32, u64, String)>,
	next_string: u64,
}

impl JitRuntime for Host {
	fn add_static_root(&mut self, address: u64) {
		self.roots.push(address);
	}

	fn intern_string(&mut self, token: u32, chars: &str) -> u64 {
		let address = STRING_BASE + self.next_string;
		self.next_string += 0x100;
		self.strings.push((token, address, chars.to_string()));
		address
	}
}

//----------------------------------------------------------------------------------------------------------------------
// Reference evaluator
//----------------------------------------------------------------------------------------------------------------------

pub const NATIVE_BASE: u64 = 0x100;
const HEAP_BASE: u64 = 0x1000_0000;
const FRAME_BASE: u64 = 0x7000_0000;

#[derive(Debug, Copy, Clone)]
pub enum Native {
	GcNew,
	GcUpdate,
	GcUpdateRef,
	Memcpy,
	Memset,
	ManagedMemcpy,
	ManagedRefMemcpy,
	IsInstance,
	CastToInterface,
	GetArrayType,
	CtorNop,
	LogAppend,
}

/// Binds the runtime helper natives, every type handle, and the exception
/// constructors into the context. Must run before `compile_assembly` so the
/// module links.
pub fn bind_runtime<'l>(registry: &'l TypeRegistry<'l>, context: &CodeContext) -> HashMap<u64, Native> {
	let mut natives = HashMap::new();
	let mut next = NATIVE_BASE;

	let mut bind = |name: &str, native: Native| {
		context.load_external(name, next);
		natives.insert(next, native);
		next += 1;
	};

	bind("gc_new", Native::GcNew);
	bind("gc_update", Native::GcUpdate);
	bind("gc_update_ref", Native::GcUpdateRef);
	bind("memcpy", Native::Memcpy);
	bind("memset", Native::Memset);
	bind("managed_memcpy", Native::ManagedMemcpy);
	bind("managed_ref_memcpy", Native::ManagedRefMemcpy);
	bind("isinstance", Native::IsInstance);
	bind("dynamic_cast_obj_to_interface", Native::CastToInterface);
	bind("get_array_type", Native::GetArrayType);

	for ty in registry.well_known().runtime_exceptions() {
		let ctor = ty.find_method(".ctor").expect("exception without a constructor");
		bind(&ctor.to_string(), Native::CtorNop);
	}

	for ty in registry.types() {
		context.load_external(ty.to_string(), ty.id() as u64);
	}

	natives
}

/// Binds one extra native under an explicit symbol name, for imported test
/// methods.
pub fn bind_native(context: &CodeContext, natives: &mut HashMap<u64, Native>, name: &str, native: Native) {
	let address = NATIVE_BASE + 0x1000 + natives.len() as u64;
	context.load_external(name, address);
	natives.insert(address, native);
}

/// Interprets linked backend IR over a simulated byte-addressed memory.
/// Stands in for the machine-code generator so the compiled programs can be
/// driven end to end.
pub struct Machine<'l, 'c> {
	registry: &'l TypeRegistry<'l>,
	context: &'c CodeContext,
	natives: HashMap<u64, Native>,
	modules: HashMap<u32, LinkedModule>,
	vtables: HashMap<u32, u64>,
	mem: HashMap<u64, u8>,
	heap_next: u64,
	frame_next: u64,
	pub log: Vec<i64>,
}

impl<'l, 'c> Machine<'l, 'c> {
	pub fn new(registry: &'l TypeRegistry<'l>, context: &'c CodeContext, natives: HashMap<u64, Native>) -> Self {
		Self {
			registry,
			context,
			natives,
			modules: HashMap::new(),
			vtables: HashMap::new(),
			mem: HashMap::new(),
			heap_next: HEAP_BASE,
			frame_next: FRAME_BASE,
			log: vec![],
		}
	}

	pub fn read(&self, address: u64, size: u32) -> u64 {
		let mut value = 0u64;
		for i in 0..size as u64 {
			value |= (*self.mem.get(&(address + i)).unwrap_or(&0) as u64) << (i * 8);
		}
		value
	}

	pub fn write(&mut self, address: u64, size: u32, value: u64) {
		for i in 0..size as u64 {
			self.mem.insert(address + i, (value >> (i * 8)) as u8);
		}
	}

	fn alloc_heap(&mut self, size: u64) -> u64 {
		let address = self.heap_next;
		self.heap_next += (size + 15) & !7;
		address
	}

	fn vtable_addr(&mut self, ty: &'l Type<'l>) -> u64 {
		if let Some(&address) = self.vtables.get(&ty.id()) {
			return address;
		}
		let slots = ty.vtable.borrow().clone();
		let address = self.alloc_heap(8 + 8 * slots.len().max(1) as u64);
		self.write(address, 8, ty.id() as u64);
		for (i, slot) in slots.iter().enumerate() {
			self.write(address + 8 + 8 * i as u64, 8, slot.map(|addr| addr.0).unwrap_or(0));
		}
		self.vtables.insert(ty.id(), address);
		address
	}

	pub fn type_of_object(&self, object: u64) -> Option<&'l Type<'l>> {
		let vtable = self.read(object, 8);
		self.registry.type_by_id(self.read(vtable, 8) as u32)
	}

	fn mem_addr(&self, regs: &[u64], mem: &MirMemOp) -> u64 {
		let mut address = regs[mem.base.0 as usize] as i64 + mem.disp;
		if let Some(index) = mem.index {
			address += regs[index.0 as usize] as i64 * mem.scale as i64;
		}
		address as u64
	}

	fn eval(&self, regs: &[u64], items: &[u64], op: &MirOp) -> u64 {
		match op {
			MirOp::Reg(reg) => regs[reg.0 as usize],
			MirOp::Int(value) => *value as u64,
			MirOp::Float(value) => value.to_bits() as u64,
			MirOp::Double(value) => value.to_bits(),
			MirOp::Ref(item) => items[item.0 as usize],
			MirOp::Label(_) => panic!("label operand evaluated as a value"),
			MirOp::Mem(mem) => {
				let raw = self.read(self.mem_addr(regs, mem), mem.ty.size());
				match mem.ty {
					MirType::I8 => raw as u8 as i8 as i64 as u64,
					MirType::I16 => raw as u16 as i16 as i64 as u64,
					MirType::I32 => raw as u32 as i32 as i64 as u64,
					_ => raw,
				}
			}
		}
	}

	fn store(&mut self, regs: &mut [u64], op: &MirOp, value: u64) {
		match op {
			MirOp::Reg(reg) => regs[reg.0 as usize] = value,
			MirOp::Mem(mem) => {
				let address = self.mem_addr(regs, mem);
				self.write(address, mem.ty.size(), value);
			}
			other => panic!("cannot store into {other:?}"),
		}
	}

	/// Calls the function behind `addr` with raw argument values and returns
	/// its result slots (exception first).
	pub fn invoke(&mut self, addr: FuncAddr, args: &[u64]) -> Vec<u64> {
		if let Some(&native) = self.natives.get(&addr.0) {
			return self.call_native(native, args);
		}

		let (module_id, item_id) = self.context.function_at(addr).expect("unknown function address");
		let context = self.context;
		let linked = self
			.modules
			.entry(module_id.0)
			.or_insert_with(|| context.linked_module(module_id))
			.clone();
		let func: MirFunc = match linked.module.item(item_id) {
			MirItem::Func(func) => func.clone(),
			other => panic!("call target is not a function: {other:?}"),
		};
		let items = &linked.item_values;

		let mut regs = vec![0u64; func.reg_count() + 1];
		regs[1..=args.len()].copy_from_slice(args);

		let mut labels = HashMap::new();
		for (pc, insn) in func.insns.iter().enumerate() {
			if insn.code == MirInsnCode::Label {
				if let MirOp::Label(label) = insn.ops[0] {
					labels.insert(label.0, pc);
				}
			}
		}
		let label_pc = |op: &MirOp| -> usize {
			match op {
				MirOp::Label(label) => labels[&label.0],
				other => panic!("expected a label, got {other:?}"),
			}
		};

		let frame_base = self.frame_next;
		let sx32 = |value: u64| value as u32 as i32 as i64 as u64;
		let f32_of = |value: u64| f32::from_bits(value as u32);
		let f64_of = f64::from_bits;

		let mut pc = 0usize;
		loop {
			let insn = &func.insns[pc];
			let mut next_pc = pc + 1;
			use MirInsnCode::*;

			match insn.code {
				Label => {}

				Alloca => {
					let size = self.eval(&regs, items, &insn.ops[1]);
					let address = self.frame_next;
					self.frame_next += (size + 15) & !7;
					self.store(&mut regs, &insn.ops[0], address);
				}

				Mov | FMov | DMov => {
					let value = self.eval(&regs, items, &insn.ops[1]);
					self.store(&mut regs, &insn.ops[0], value);
				}

				Ext8 | UExt8 | Ext16 | UExt16 | Ext32 | UExt32 => {
					let value = self.eval(&regs, items, &insn.ops[1]);
					let value = match insn.code {
						Ext8 => value as u8 as i8 as i64 as u64,
						UExt8 => value as u8 as u64,
						Ext16 => value as u16 as i16 as i64 as u64,
						UExt16 => value as u16 as u64,
						Ext32 => sx32(value),
						_ => value as u32 as u64,
					};
					self.store(&mut regs, &insn.ops[0], value);
				}

				I2F => {
					let value = self.eval(&regs, items, &insn.ops[1]) as i64;
					self.store(&mut regs, &insn.ops[0], (value as f32).to_bits() as u64);
				}
				I2D => {
					let value = self.eval(&regs, items, &insn.ops[1]) as i64;
					self.store(&mut regs, &insn.ops[0], (value as f64).to_bits());
				}
				F2I => {
					let value = f32_of(self.eval(&regs, items, &insn.ops[1]));
					self.store(&mut regs, &insn.ops[0], (value as i64) as u64);
				}
				D2I => {
					let value = f64_of(self.eval(&regs, items, &insn.ops[1]));
					self.store(&mut regs, &insn.ops[0], (value as i64) as u64);
				}
				F2D => {
					let value = f32_of(self.eval(&regs, items, &insn.ops[1]));
					self.store(&mut regs, &insn.ops[0], (value as f64).to_bits());
				}
				D2F => {
					let value = f64_of(self.eval(&regs, items, &insn.ops[1]));
					self.store(&mut regs, &insn.ops[0], (value as f32).to_bits() as u64);
				}

				Neg | NegS | FNeg | DNeg => {
					let value = self.eval(&regs, items, &insn.ops[1]);
					let value = match insn.code {
						Neg => (value as i64).wrapping_neg() as u64,
						NegS => sx32((value as i32).wrapping_neg() as u32 as u64),
						FNeg => (-f32_of(value)).to_bits() as u64,
						_ => (-f64_of(value)).to_bits(),
					};
					self.store(&mut regs, &insn.ops[0], value);
				}

				Add | Sub | Mul | Div | UDiv | Mod | UMod | And | Or | Xor
				| AddS | SubS | MulS | DivS | UDivS | ModS | UModS | AndS | OrS | XorS
				| FAdd | FSub | FMul | FDiv | DAdd | DSub | DMul | DDiv => {
					let a = self.eval(&regs, items, &insn.ops[1]);
					let b = self.eval(&regs, items, &insn.ops[2]);
					let value = match insn.code {
						Add => (a as i64).wrapping_add(b as i64) as u64,
						Sub => (a as i64).wrapping_sub(b as i64) as u64,
						Mul => (a as i64).wrapping_mul(b as i64) as u64,
						Div => ((a as i64) / (b as i64)) as u64,
						UDiv => a / b,
						Mod => ((a as i64) % (b as i64)) as u64,
						UMod => a % b,
						And => a & b,
						Or => a | b,
						Xor => a ^ b,
						AddS => sx32((a as i32).wrapping_add(b as i32) as u32 as u64),
						SubS => sx32((a as i32).wrapping_sub(b as i32) as u32 as u64),
						MulS => sx32((a as i32).wrapping_mul(b as i32) as u32 as u64),
						DivS => sx32(((a as i32) / (b as i32)) as u32 as u64),
						UDivS => sx32(((a as u32) / (b as u32)) as u64),
						ModS => sx32(((a as i32) % (b as i32)) as u32 as u64),
						UModS => sx32(((a as u32) % (b as u32)) as u64),
						AndS => sx32(a & b & 0xFFFF_FFFF),
						OrS => sx32((a | b) & 0xFFFF_FFFF),
						XorS => sx32((a ^ b) & 0xFFFF_FFFF),
						FAdd => (f32_of(a) + f32_of(b)).to_bits() as u64,
						FSub => (f32_of(a) - f32_of(b)).to_bits() as u64,
						FMul => (f32_of(a) * f32_of(b)).to_bits() as u64,
						FDiv => (f32_of(a) / f32_of(b)).to_bits() as u64,
						DAdd => (f64_of(a) + f64_of(b)).to_bits(),
						DSub => (f64_of(a) - f64_of(b)).to_bits(),
						DMul => (f64_of(a) * f64_of(b)).to_bits(),
						_ => (f64_of(a) / f64_of(b)).to_bits(),
					};
					self.store(&mut regs, &insn.ops[0], value);
				}

				Eq | Ne | Lt | ULt | Le | ULe | Gt | UGt | Ge | UGe
				| EqS | NeS | LtS | ULtS | LeS | ULeS | GtS | UGtS | GeS | UGeS
				| FEq | FNe | FLt | FLe | FGt | FGe | DEq | DNe | DLt | DLe | DGt | DGe => {
					let a = self.eval(&regs, items, &insn.ops[1]);
					let b = self.eval(&regs, items, &insn.ops[2]);
					let result = Self::compare(insn.code, a, b);
					self.store(&mut regs, &insn.ops[0], result as u64);
				}

				Jmp => next_pc = label_pc(&insn.ops[0]),

				Bt | BtS | Bf | BfS => {
					let value = self.eval(&regs, items, &insn.ops[1]);
					let truthy = match insn.code {
						Bt => value != 0,
						BtS => value as u32 != 0,
						Bf => value == 0,
						_ => value as u32 == 0,
					};
					if truthy {
						next_pc = label_pc(&insn.ops[0]);
					}
				}

				Beq | Bne | Blt | UBlt | Ble | UBle | Bgt | UBgt | Bge | UBge
				| BeqS | BneS | BltS | UBltS | BleS | UBleS | BgtS | UBgtS | BgeS | UBgeS
				| FBeq | FBne | FBlt | FBle | FBgt | FBge | DBeq | DBne | DBlt | DBle | DBgt | DBge => {
					let a = self.eval(&regs, items, &insn.ops[1]);
					let b = self.eval(&regs, items, &insn.ops[2]);
					if Self::branch_compare(insn.code, a, b) {
						next_pc = label_pc(&insn.ops[0]);
					}
				}

				Switch => {
					let selector = self.eval(&regs, items, &insn.ops[0]) as usize;
					next_pc = label_pc(&insn.ops[1 + selector]);
				}

				Call | Inline => {
					let proto = match insn.ops[0] {
						MirOp::Ref(item) => item,
						other => panic!("call without a prototype: {other:?}"),
					};
					let nres = match linked.module.item(proto) {
						MirItem::Proto { results, .. } => results.len(),
						other => panic!("call through a non-prototype: {other:?}"),
					};
					let callee = self.eval(&regs, items, &insn.ops[1]);
					let call_args: Vec<u64> =
						insn.ops[2 + nres..].iter().map(|op| self.eval(&regs, items, op)).collect();

					let results = self.invoke(FuncAddr(callee), &call_args);
					for (i, value) in results.iter().take(nres).enumerate() {
						self.store(&mut regs, &insn.ops[2 + i], *value);
					}
				}

				Ret => {
					let values = insn.ops.iter().map(|op| self.eval(&regs, items, op)).collect();
					self.frame_next = frame_base;
					return values;
				}
			}

			pc = next_pc;
		}
	}

	fn compare(code: MirInsnCode, a: u64, b: u64) -> bool {
		use MirInsnCode::*;
		let f32_of = |value: u64| f32::from_bits(value as u32);
		match code {
			Eq => a == b,
			Ne => a != b,
			Lt => (a as i64) < (b as i64),
			Le => (a as i64) <= (b as i64),
			Gt => (a as i64) > (b as i64),
			Ge => (a as i64) >= (b as i64),
			ULt => a < b,
			ULe => a <= b,
			UGt => a > b,
			UGe => a >= b,
			EqS => a as u32 == b as u32,
			NeS => a as u32 != b as u32,
			LtS => (a as i32) < (b as i32),
			LeS => (a as i32) <= (b as i32),
			GtS => (a as i32) > (b as i32),
			GeS => (a as i32) >= (b as i32),
			ULtS => (a as u32) < (b as u32),
			ULeS => (a as u32) <= (b as u32),
			UGtS => (a as u32) > (b as u32),
			UGeS => (a as u32) >= (b as u32),
			FEq => f32_of(a) == f32_of(b),
			FNe => f32_of(a) != f32_of(b),
			FLt => f32_of(a) < f32_of(b),
			FLe => f32_of(a) <= f32_of(b),
			FGt => f32_of(a) > f32_of(b),
			FGe => f32_of(a) >= f32_of(b),
			DEq => f64::from_bits(a) == f64::from_bits(b),
			DNe => f64::from_bits(a) != f64::from_bits(b),
			DLt => f64::from_bits(a) < f64::from_bits(b),
			DLe => f64::from_bits(a) <= f64::from_bits(b),
			DGt => f64::from_bits(a) > f64::from_bits(b),
			DGe => f64::from_bits(a) >= f64::from_bits(b),
			other => panic!("not a comparison: {other:?}"),
		}
	}

	fn branch_compare(code: MirInsnCode, a: u64, b: u64) -> bool {
		use MirInsnCode::*;
		let equivalent = match code {
			Beq => Eq,
			Bne => Ne,
			Blt => Lt,
			Ble => Le,
			Bgt => Gt,
			Bge => Ge,
			UBlt => ULt,
			UBle => ULe,
			UBgt => UGt,
			UBge => UGe,
			BeqS => EqS,
			BneS => NeS,
			BltS => LtS,
			BleS => LeS,
			BgtS => GtS,
			BgeS => GeS,
			UBltS => ULtS,
			UBleS => ULeS,
			UBgtS => UGtS,
			UBgeS => UGeS,
			FBeq => FEq,
			FBne => FNe,
			FBlt => FLt,
			FBle => FLe,
			FBgt => FGt,
			FBge => FGe,
			DBeq => DEq,
			DBne => DNe,
			DBlt => DLt,
			DBle => DLe,
			DBgt => DGt,
			DBge => DGe,
			other => panic!("not a branch comparison: {other:?}"),
		};
		Self::compare(equivalent, a, b)
	}

	fn call_native(&mut self, native: Native, args: &[u64]) -> Vec<u64> {
		match native {
			Native::GcNew => {
				let ty = self.registry.type_by_id(args[0] as u32).expect("gc_new with unknown type");
				let object = self.alloc_heap(args[1].max(16));
				let vtable = self.vtable_addr(ty);
				self.write(object, 8, vtable);
				vec![object]
			}
			Native::GcUpdate => {
				self.write(args[0] + args[1], 8, args[2]);
				vec![]
			}
			Native::GcUpdateRef => {
				self.write(args[0], 8, args[1]);
				vec![]
			}
			Native::Memcpy => {
				for i in 0..args[2] {
					let byte = self.read(args[1] + i, 1);
					self.write(args[0] + i, 1, byte);
				}
				vec![]
			}
			Native::Memset => {
				for i in 0..args[2] {
					self.write(args[0] + i, 1, args[1]);
				}
				vec![]
			}
			Native::ManagedMemcpy => {
				let ty = self.registry.type_by_id(args[1] as u32).expect("unknown struct type");
				for i in 0..ty.stack_size.get() as u64 {
					let byte = self.read(args[3] + i, 1);
					self.write(args[0] + args[2] + i, 1, byte);
				}
				vec![]
			}
			Native::ManagedRefMemcpy => {
				let ty = self.registry.type_by_id(args[1] as u32).expect("unknown struct type");
				for i in 0..ty.stack_size.get() as u64 {
					let byte = self.read(args[2] + i, 1);
					self.write(args[0] + i, 1, byte);
				}
				vec![]
			}
			Native::IsInstance => {
				let result = args[0] == 0 || {
					let object_type = self.type_of_object(args[0]).expect("object without a type");
					let target = self.registry.type_by_id(args[1] as u32).expect("unknown type");
					self.registry.is_verifier_assignable_to(Some(object_type), Some(target))
				};
				vec![result as u64]
			}
			Native::CastToInterface => {
				let source = args[1];
				let source_type = self.type_of_object(source).expect("object without a type");
				let target = self.registry.type_by_id(args[2] as u32).expect("unknown interface");
				match source_type.interface_impl(target) {
					None => {
						self.write(args[0], 8, 0);
						self.write(args[0] + 8, 8, 0);
						vec![0]
					}
					Some(interface) => {
						let vtable = self.vtable_addr(source_type);
						self.write(args[0], 8, vtable + 8 + interface.vtable_offset as u64 * 8);
						self.write(args[0] + 8, 8, source);
						vec![1]
					}
				}
			}
			Native::GetArrayType => {
				let element = self.registry.type_by_id(args[0] as u32).expect("unknown element type");
				vec![self.registry.array_type_of(element).id() as u64]
			}
			Native::CtorNop => vec![0],
			Native::LogAppend => {
				self.log.push(args[0] as i32 as i64);
				vec![0]
			}
		}
	}
}
