use std::collections::HashMap;

use fxhash::FxHashMap;
use nohash_hasher::BuildNoHashHasher;

use crate::errors::{JitError, Result};
use crate::metadata_token::MetadataToken;
use crate::mir::{MirInsn, MirInsnCode, MirItemId, MirLabel, MirModule, MirOp, MirReg, MirType, MirVar};
use crate::model::access::{check_field_accessibility, check_method_accessibility, check_type_visibility};
use crate::model::{Assembly, Field, Method, MethodBody, StackType, Type};
use crate::registry::TypeRegistry;
use crate::utilities::check;

use super::stack::{StackSlot, StackSnapshot};

/// The prototype and forward/import item of a prepared method.
#[derive(Debug, Copy, Clone)]
pub(crate) struct FunctionEntry {
	pub proto: MirItemId,
	pub forward: Option<MirItemId>,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct StaticFieldEntry {
	pub item: MirItemId,
	pub is_bss: bool,
}

/// Prototype/import item pairs for the runtime helpers every module calls.
#[derive(Debug, Copy, Clone)]
pub(crate) struct RuntimeItems {
	pub gc_new: (MirItemId, MirItemId),
	pub get_array_type: (MirItemId, MirItemId),
	pub gc_update: (MirItemId, MirItemId),
	pub gc_update_ref: (MirItemId, MirItemId),
	pub managed_memcpy: (MirItemId, MirItemId),
	pub managed_ref_memcpy: (MirItemId, MirItemId),
	pub memcpy: (MirItemId, MirItemId),
	pub memset: (MirItemId, MirItemId),
	pub dynamic_cast_obj_to_interface: (MirItemId, MirItemId),
	pub is_instance: (MirItemId, MirItemId),
}

/// Labels tracked for one exception clause: the handler entry, the
/// `endfinally` continuation filled in by `leave` lowering, and whether this
/// finally is the last of its chain.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ClauseLabels {
	pub label: MirLabel,
	pub endfinally: Option<MirLabel>,
	pub last_in_chain: bool,
}

/// The translation context for one assembly. Owns the module under
/// construction plus the per-method state of the stack abstract interpreter;
/// nothing here is shared until the module is published.
pub(crate) struct JitContext<'l> {
	pub registry: &'l TypeRegistry<'l>,
	pub assembly: &'l Assembly<'l>,
	pub module: MirModule,

	pub functions: FxHashMap<&'l Method<'l>, FunctionEntry>,
	pub types: FxHashMap<&'l Type<'l>, MirItemId>,
	pub static_fields: FxHashMap<&'l Field<'l>, StaticFieldEntry>,
	pub strings: HashMap<u32, MirItemId, BuildNoHashHasher<u32>>,
	pub runtime: RuntimeItems,

	// state of the method currently being translated
	pub method: Option<&'l Method<'l>>,
	pub body: Option<MethodBody<'l>>,
	pub func: Option<MirItemId>,
	pub name_gen: u32,
	pub exception_reg: MirReg,
	pub return_block: Option<MirReg>,
	pub locals: Vec<MirReg>,
	pub stack: Vec<StackSlot<'l>>,
	pub snapshots: HashMap<u32, StackSnapshot<'l>, BuildNoHashHasher<u32>>,
	pub clauses: Vec<ClauseLabels>,
}

impl<'l> JitContext<'l> {
	pub fn new(registry: &'l TypeRegistry<'l>, assembly: &'l Assembly<'l>) -> Self {
		let mut module = MirModule::new(assembly.name);

		let mut runtime_pair = |name: &str, results: Vec<MirType>, params: Vec<MirVar>| {
			let proto = module.new_proto(format!("{name}$proto"), results, params);
			let func = module.new_import(name);
			(proto, func)
		};

		let runtime = RuntimeItems {
			gc_new: runtime_pair(
				"gc_new",
				vec![MirType::P],
				vec![MirVar::new("type", MirType::P), MirVar::new("size", MirType::U64)],
			),
			get_array_type: runtime_pair(
				"get_array_type",
				vec![MirType::P],
				vec![MirVar::new("type", MirType::P)],
			),
			gc_update: runtime_pair(
				"gc_update",
				vec![],
				vec![
					MirVar::new("o", MirType::P),
					MirVar::new("idx", MirType::U64),
					MirVar::new("new", MirType::P),
				],
			),
			gc_update_ref: runtime_pair(
				"gc_update_ref",
				vec![],
				vec![MirVar::new("o", MirType::P), MirVar::new("new", MirType::P)],
			),
			managed_memcpy: runtime_pair(
				"managed_memcpy",
				vec![],
				vec![
					MirVar::new("this", MirType::P),
					MirVar::new("struct_type", MirType::P),
					MirVar::new("offset", MirType::I32),
					MirVar::new("from", MirType::P),
				],
			),
			managed_ref_memcpy: runtime_pair(
				"managed_ref_memcpy",
				vec![],
				vec![
					MirVar::new("this", MirType::P),
					MirVar::new("struct_type", MirType::P),
					MirVar::new("from", MirType::P),
				],
			),
			memcpy: runtime_pair(
				"memcpy",
				vec![],
				vec![
					MirVar::new("dest", MirType::P),
					MirVar::new("src", MirType::P),
					MirVar::new("count", MirType::U64),
				],
			),
			memset: runtime_pair(
				"memset",
				vec![],
				vec![
					MirVar::new("dest", MirType::P),
					MirVar::new("c", MirType::I32),
					MirVar::new("count", MirType::U64),
				],
			),
			dynamic_cast_obj_to_interface: runtime_pair(
				"dynamic_cast_obj_to_interface",
				vec![MirType::I8],
				vec![
					MirVar::new("dest", MirType::P),
					MirVar::new("source", MirType::P),
					MirVar::new("targetInterface", MirType::P),
				],
			),
			is_instance: runtime_pair(
				"isinstance",
				vec![MirType::I8],
				vec![MirVar::new("object", MirType::P), MirVar::new("type", MirType::P)],
			),
		};

		Self {
			registry,
			assembly,
			module,
			functions: Default::default(),
			types: Default::default(),
			static_fields: Default::default(),
			strings: Default::default(),
			runtime,
			method: None,
			body: None,
			func: None,
			name_gen: 0,
			exception_reg: MirReg(0),
			return_block: None,
			locals: vec![],
			stack: vec![],
			snapshots: Default::default(),
			clauses: vec![],
		}
	}

	pub fn current_method(&self) -> Result<&'l Method<'l>> {
		self.method.ok_or(JitError::CheckFailed)
	}

	pub fn clause_list(&self) -> Vec<crate::model::ExceptionClause<'l>> {
		self.body.as_ref().map(|body| body.exception_clauses.clone()).unwrap_or_default()
	}

	pub fn local_type(&self, index: usize) -> Result<&'l Type<'l>> {
		let body = self.body.as_ref().ok_or(JitError::CheckFailed)?;
		body.locals.get(index).copied().ok_or(JitError::CheckFailed)
	}

	/// Offset of an array's `Length` field: right behind the object header.
	pub fn array_length_offset(&self) -> i64 {
		self.registry.well_known().object.managed_size.get() as i64
	}

	/// Offset of an array's data area.
	pub fn array_data_offset(&self) -> i64 {
		self.registry.well_known().array.managed_size.get() as i64
	}

	//------------------------------------------------------------------------------------------------------------------
	// Type helpers
	//------------------------------------------------------------------------------------------------------------------

	/// The backend type a CIL type lowers to. Value types and interface
	/// slots are by-address blocks; everything else fits a register.
	pub fn mir_type(&self, ty: &'l Type<'l>) -> MirType {
		let wk = self.registry.well_known();
		let ty = self.registry.underlying_type(ty);
		match ty {
			t if t == wk.byte => MirType::U8,
			t if t == wk.sbyte => MirType::I8,
			t if t == wk.uint16 => MirType::U16,
			t if t == wk.int16 => MirType::I16,
			t if t == wk.uint32 => MirType::U32,
			t if t == wk.int32 => MirType::I32,
			t if t == wk.uint64 => MirType::U64,
			t if t == wk.int64 => MirType::I64,
			t if t == wk.uintptr => MirType::U64,
			t if t == wk.intptr => MirType::I64,
			t if t == wk.char => MirType::U16,
			t if t == wk.boolean => MirType::I8,
			t if t == wk.single => MirType::F,
			t if t == wk.double => MirType::D,
			t if t.is_value_type.get() || t.is_interface() => MirType::Blk(t.stack_size.get()),
			_ => MirType::P,
		}
	}

	/// The move instruction matching a value's register class.
	pub fn number_inscode(&self, ty: Option<&'l Type<'l>>) -> MirInsnCode {
		let wk = self.registry.well_known();
		match ty {
			Some(t) if t == wk.single => MirInsnCode::FMov,
			Some(t) if t == wk.double => MirInsnCode::DMov,
			_ => MirInsnCode::Mov,
		}
	}

	/// The move-or-convert instruction for storing `src` into a slot of
	/// `dest`'s type; integer widths are handled by the memory operand.
	pub fn number_cast_inscode(&self, src: Option<&'l Type<'l>>, dest: &'l Type<'l>) -> MirInsnCode {
		let wk = self.registry.well_known();
		match src {
			Some(t) if t == wk.single => match dest {
				d if d == wk.double => MirInsnCode::F2D,
				d if d == wk.single => MirInsnCode::FMov,
				_ => MirInsnCode::Mov,
			},
			Some(t) if t == wk.double => match dest {
				d if d == wk.single => MirInsnCode::D2F,
				d if d == wk.double => MirInsnCode::DMov,
				_ => MirInsnCode::Mov,
			},
			_ => MirInsnCode::Mov,
		}
	}

	//------------------------------------------------------------------------------------------------------------------
	// Emission helpers
	//------------------------------------------------------------------------------------------------------------------

	fn func_mut(&mut self) -> &mut crate::mir::MirFunc {
		let id = self.func.expect("no function under construction");
		self.module.func_mut(id)
	}

	pub fn append(&mut self, code: MirInsnCode, ops: Vec<MirOp>) {
		self.func_mut().append(MirInsn::new(code, ops));
	}

	pub fn append_label(&mut self, label: MirLabel) {
		self.func_mut().append(MirInsn::label(label));
	}

	pub fn new_label(&mut self) -> MirLabel {
		self.func_mut().new_label()
	}

	pub fn arg_reg(&mut self, name: &str) -> Result<MirReg> {
		self.func_mut().reg_by_name(name).ok_or(JitError::NotFound)
	}

	/// Allocates a backing register for a stack slot of the given type.
	/// Value types and interface slots get a stack-allocated block whose
	/// address lives in the register; the allocation is prepended so it runs
	/// at function entry.
	pub fn new_reg(&mut self, ty: Option<&'l Type<'l>>) -> MirReg {
		self.name_gen += 1;
		let name = format!("s{}", self.name_gen);
		let wk = self.registry.well_known();

		let (mir_type, block_size) = match ty {
			// the null reference lives in a plain register
			None => (MirType::I64, None),
			Some(ty) => match ty.stack_type.get() {
				StackType::Int32 | StackType::Int64 | StackType::IntPtr | StackType::O | StackType::Ref => {
					match ty.is_interface() {
						true => (MirType::I64, Some(ty.stack_size.get())),
						false => (MirType::I64, None),
					}
				}
				StackType::Float => match ty == wk.single {
					true => (MirType::F, None),
					false => (MirType::D, None),
				},
				StackType::ValueType => (MirType::I64, Some(ty.stack_size.get())),
			},
		};

		let func = self.func_mut();
		let reg = func.new_reg(name, mir_type);
		if let Some(size) = block_size {
			func.prepend(MirInsn::new(
				MirInsnCode::Alloca,
				vec![MirOp::Reg(reg), MirOp::Int(size as i64)],
			));
		}
		reg
	}

	/// Copies `count` bytes from `src` to `dest`; short copies are unrolled
	/// into 8-byte moves, anything else calls out to `memcpy`.
	pub fn emit_memcpy(&mut self, dest: MirReg, src: MirReg, count: u32) {
		if count <= 32 && count % 8 == 0 {
			for offset in (0..count as i64).step_by(8) {
				self.append(
					MirInsnCode::Mov,
					vec![
						MirOp::mem(MirType::I64, offset, dest),
						MirOp::mem(MirType::I64, offset, src),
					],
				);
			}
		} else {
			let (proto, func) = self.runtime.memcpy;
			self.append(
				MirInsnCode::Call,
				vec![
					MirOp::Ref(proto),
					MirOp::Ref(func),
					MirOp::Reg(dest),
					MirOp::Reg(src),
					MirOp::Int(count as i64),
				],
			);
		}
	}

	pub fn emit_zerofill(&mut self, dest: MirReg, count: u32) {
		if count <= 32 && count % 8 == 0 {
			for offset in (0..count as i64).step_by(8) {
				self.append(MirInsnCode::Mov, vec![MirOp::mem(MirType::I64, offset, dest), MirOp::Int(0)]);
			}
		} else {
			let (proto, func) = self.runtime.memset;
			self.append(
				MirInsnCode::Call,
				vec![
					MirOp::Ref(proto),
					MirOp::Ref(func),
					MirOp::Reg(dest),
					MirOp::Int(0),
					MirOp::Int(count as i64),
				],
			);
		}
	}

	//------------------------------------------------------------------------------------------------------------------
	// Token resolution
	//------------------------------------------------------------------------------------------------------------------

	pub fn declaring_type(&self) -> Result<&'l Type<'l>> {
		let method = self.method.ok_or(JitError::CheckFailed)?;
		method.declaring_type.get().ok_or(JitError::NotFound)
	}

	pub fn resolve_type(&self, token: MetadataToken) -> Result<&'l Type<'l>> {
		let ty = self.assembly.type_by_token(token)?;
		check!(check_type_visibility(self.declaring_type()?, ty));
		Ok(ty)
	}

	pub fn resolve_method(&self, token: MetadataToken) -> Result<&'l Method<'l>> {
		let method = self.assembly.method_by_token(token)?;
		check!(check_method_accessibility(self.declaring_type()?, method));
		Ok(method)
	}

	pub fn resolve_field(&self, token: MetadataToken) -> Result<&'l Field<'l>> {
		let field = self.assembly.field_by_token(token)?;
		check!(check_field_accessibility(self.declaring_type()?, field));
		Ok(field)
	}

	pub fn type_item(&self, ty: &'l Type<'l>) -> Result<MirItemId> {
		self.types.get(ty).copied().ok_or(JitError::NotFound)
	}

	pub fn function_entry(&self, method: &'l Method<'l>) -> Result<FunctionEntry> {
		self.functions.get(method).copied().ok_or(JitError::NotFound)
	}

	//------------------------------------------------------------------------------------------------------------------
	// Signature preparation
	//------------------------------------------------------------------------------------------------------------------

	/// The number of result slots of a method: the exception slot, plus the
	/// value slot unless the return value travels through a hidden block.
	pub fn method_nres(&self, method: &'l Method<'l>) -> usize {
		match method.return_type.get() {
			Some(ret) if !self.mir_type(ret).is_blk() => 2,
			_ => 1,
		}
	}

	/// Builds the prototype and the forward (to be defined here) or import
	/// (external, unmanaged or internal-call) declaration of a method, and
	/// records both in the function map.
	pub fn prepare_method_signature(&mut self, method: &'l Method<'l>, external: bool) -> Result<()> {
		let func_name = method.to_string();
		let proto_name = format!("{func_name}$proto");

		let mut results = vec![MirType::P];
		let mut vars = vec![];

		if let Some(ret) = method.return_type.get() {
			let ret_type = self.mir_type(ret);
			match ret_type {
				// value-type returns travel through a caller-provided block
				MirType::Blk(_) => vars.push(MirVar::new("return_block", MirType::P)),
				other => results.push(other),
			}
		}

		if !method.is_static() {
			let declaring = method.declaring_type.get().ok_or(JitError::NotFound)?;
			let this_type = match self.mir_type(declaring) {
				// value-type receivers are passed by reference
				MirType::Blk(_) => MirType::P,
				other => other,
			};
			vars.push(MirVar::new("this", this_type));
		}

		for (i, parameter) in method.parameters.borrow().iter().enumerate() {
			vars.push(MirVar::new(format!("arg{i}"), self.mir_type(parameter)));
		}

		let proto = self.module.new_proto(proto_name, results, vars);

		let mut forward = None;
		if !method.is_abstract() {
			if external || method.is_unmanaged() || method.is_internal_call() {
				forward = Some(self.module.new_import(&func_name));
			} else {
				forward = Some(self.module.new_forward(&func_name));
				self.module.new_export(&func_name);
			}
		}

		self.functions.insert(method, FunctionEntry { proto, forward });
		Ok(())
	}

	/// Declares a type import and, for external types, the signatures of all
	/// of its methods.
	pub fn import_type(&mut self, ty: &'l Type<'l>, all_methods: bool) -> Result<()> {
		if self.types.contains_key(ty) {
			return Ok(());
		}

		let item = self.module.new_import(ty.to_string());
		self.types.insert(ty, item);

		if all_methods {
			let methods = ty.methods.borrow().clone();
			for method in methods {
				self.prepare_method_signature(method, true)?;
			}
		}
		Ok(())
	}
}
