//! Translation of one IL method body: the scan loop of the stack abstract
//! interpreter and the lowering of every supported opcode.

use crate::errors::{JitError, Result};
use crate::il::{CompoundOpCode, ControlFlow, OpCode, OpCodeIterator};
use crate::metadata_token::MetadataToken;
use crate::mir::{MirInsn, MirInsnCode, MirLabel, MirOp, MirReg, MirType, MirVar};
use crate::model::{ClauseKind, Method, StackType, Type, VTABLE_VIRTUAL_FUNCTIONS_OFFSET};
use crate::utilities::{check, check_fail};

use super::context::{ClauseLabels, JitContext};
use super::stack::{StackSlot, StackSnapshot};
use super::{int, item, lbl, reg};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum CallKind {
	Call,
	CallVirt,
	NewObj,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum CastKind {
	IsInst,
	CastClass,
	UnboxAny,
}

/// How a freshly built interface slot reaches its destination, and which
/// write barrier covers the instance word.
enum InterfaceStore {
	/// Stack or static storage, no barrier required.
	Plain,
	/// A slot inside a heap object: `gc_update(owner, offset, value)`.
	Object { owner: MirReg, offset: MirOp },
	/// A slot behind a managed reference: `gc_update_ref(addr, value)`.
	Ref,
}

impl<'l> JitContext<'l> {
	//------------------------------------------------------------------------------------------------------------------
	// Branch resolution
	//------------------------------------------------------------------------------------------------------------------

	/// Resolves a branch target to its join label. Forward targets record or
	/// widen a snapshot; backward targets must match the recorded stack
	/// exactly.
	fn resolve_branch(&mut self, il_offset: u32, il_target: u32) -> Result<MirLabel> {
		if il_target >= il_offset {
			if !self.snapshots.contains_key(&il_target) {
				let label = self.new_label();
				let snapshot = StackSnapshot { stack: self.stack_snapshot(), label };
				self.snapshots.insert(il_target, snapshot);
				Ok(label)
			} else {
				self.stack_merge(il_target, true)?;
				Ok(self.snapshots[&il_target].label)
			}
		} else {
			check!(self.snapshots.contains_key(&il_target));
			self.stack_merge(il_target, false)?;
			Ok(self.snapshots[&il_target].label)
		}
	}

	/// A branch may never enter or leave a try- or handler-region; only the
	/// dedicated control instructions cross those boundaries.
	fn branch_point(&mut self, il_offset: u32, il_target: u32) -> Result<MirLabel> {
		for clause in self.clause_list() {
			let offset_in_try = clause.try_contains(il_offset);
			let target_in_try = clause.try_contains(il_target);
			if offset_in_try {
				check!(target_in_try);
				break;
			}
			check!(!target_in_try);

			let offset_in_handler = clause.handler_contains(il_offset);
			let target_in_handler = clause.handler_contains(il_target);
			if offset_in_handler {
				check!(target_in_handler);
				break;
			}
			check!(!target_in_handler);
		}

		self.resolve_branch(il_offset, il_target)
	}

	fn target_of(&self, next_offset: u32, displacement: i32) -> Result<u32> {
		u32::try_from(next_offset as i64 + displacement as i64).map_err(|_| JitError::BadFormat)
	}

	//------------------------------------------------------------------------------------------------------------------
	// Shared lowering helpers
	//------------------------------------------------------------------------------------------------------------------

	fn category(slot: &StackSlot<'l>) -> StackType {
		slot.ty.map(|ty| ty.stack_type.get()).unwrap_or(StackType::O)
	}

	/// Binary arithmetic and bitwise operations. The operand category pair
	/// picks the operation width; divisions test the divisor against zero
	/// first so the throw precedes any effect of the dividend.
	fn lower_binary(&mut self, il_offset: u32, code: MirInsnCode, integer_only: bool) -> Result<()> {
		let wk = self.registry.well_known();
		let value2 = self.stack_pop()?;
		let mut value1 = self.stack_pop()?;

		if matches!(code, MirInsnCode::Div | MirInsnCode::UDiv | MirInsnCode::Mod | MirInsnCode::UMod)
			&& matches!(Self::category(&value2), StackType::Int32 | StackType::Int64 | StackType::IntPtr)
		{
			let not_zero = self.new_label();
			let test = match Self::category(&value2) {
				StackType::Int32 => MirInsnCode::Bt.int32(),
				_ => MirInsnCode::Bt,
			};
			self.append(test, vec![lbl(not_zero), reg(value2.reg)]);
			self.throw_new(il_offset, wk.divide_by_zero_exception)?;
			self.append_label(not_zero);
		}

		let mut value2_reg = value2.reg;
		let mut code = code;
		let result_reg;
		match Self::category(&value1) {
			StackType::Int32 => {
				if Self::category(&value2) == StackType::Int32 {
					result_reg = self.stack_push(Some(wk.int32))?;
					code = code.int32();
				} else {
					check!(Self::category(&value2) == StackType::IntPtr);
					result_reg = self.stack_push(Some(wk.intptr))?;
					self.append(MirInsnCode::UExt32, vec![reg(value1.reg), reg(value1.reg)]);
				}
			}

			StackType::Int64 => {
				check!(Self::category(&value2) == StackType::Int64);
				result_reg = self.stack_push(Some(wk.int64))?;
			}

			StackType::IntPtr => {
				result_reg = self.stack_push(Some(wk.intptr))?;
				if Self::category(&value2) == StackType::Int32 {
					self.append(MirInsnCode::UExt32, vec![reg(value2.reg), reg(value2.reg)]);
				} else {
					check!(Self::category(&value2) == StackType::IntPtr);
				}
			}

			StackType::Float => {
				check!(!integer_only);
				check!(value2.ty == Some(wk.single) || value2.ty == Some(wk.double));

				if value1.ty == Some(wk.single) {
					if value2.ty == Some(wk.single) {
						result_reg = self.stack_push(Some(wk.single))?;
						code = code.single();
					} else {
						// float x double promotes the left side
						result_reg = self.stack_push(Some(wk.double))?;
						self.append(MirInsnCode::F2D, vec![reg(result_reg), reg(value1.reg)]);
						value1.reg = result_reg;
						code = code.double();
					}
				} else {
					check!(value1.ty == Some(wk.double));
					result_reg = self.stack_push(Some(wk.double))?;
					code = code.double();
					if value2.ty == Some(wk.single) {
						self.append(MirInsnCode::F2D, vec![reg(result_reg), reg(value2.reg)]);
						value2_reg = result_reg;
					}
				}
			}

			StackType::ValueType | StackType::O | StackType::Ref => check_fail!(),
		}

		self.append(code, vec![reg(result_reg), reg(value1.reg), reg(value2_reg)]);
		Ok(())
	}

	/// Category coercion shared by `ceq`-style comparisons and the
	/// compare-and-branch family: returns the width-adjusted code and the
	/// operand registers after any implicit promotion.
	fn coerce_comparison(
		&mut self,
		code: MirInsnCode,
		value1: StackSlot<'l>,
		value2: StackSlot<'l>,
		equality_codes: [MirInsnCode; 2],
	) -> Result<(MirInsnCode, MirReg, MirReg)> {
		let wk = self.registry.well_known();
		let mut code = code;
		let mut value1_reg = value1.reg;
		let mut value2_reg = value2.reg;

		match Self::category(&value1) {
			StackType::Int32 => {
				if Self::category(&value2) == StackType::Int32 {
					code = code.int32();
				} else {
					check!(Self::category(&value2) == StackType::IntPtr);
					self.append(MirInsnCode::UExt32, vec![reg(value1_reg), reg(value1_reg)]);
				}
			}

			StackType::Int64 => check!(Self::category(&value2) == StackType::Int64),

			StackType::IntPtr => {
				if Self::category(&value2) == StackType::Int32 {
					self.append(MirInsnCode::UExt32, vec![reg(value2_reg), reg(value2_reg)]);
				} else {
					check!(Self::category(&value2) == StackType::IntPtr);
				}
			}

			StackType::Float => {
				check!(value2.ty == Some(wk.single) || value2.ty == Some(wk.double));

				if value1.ty == Some(wk.single) {
					if value2.ty == Some(wk.single) {
						code = code.single();
					} else {
						let promoted = self.new_reg(Some(wk.double));
						self.append(MirInsnCode::F2D, vec![reg(promoted), reg(value1_reg)]);
						value1_reg = promoted;
						code = code.double();
					}
				} else {
					check!(value1.ty == Some(wk.double));
					code = code.double();
					if value2.ty == Some(wk.single) {
						let promoted = self.new_reg(Some(wk.double));
						self.append(MirInsnCode::F2D, vec![reg(promoted), reg(value2_reg)]);
						value2_reg = promoted;
					}
				}
			}

			StackType::O => {
				check!(Self::category(&value2) == StackType::O);
				// object references only compare for (in)equality
				check!(equality_codes.contains(&code));
				// TODO: comparing an interface slot against an object needs
				//       the instance word extracted first
				check!(!value1.ty.map_or(false, |ty| ty.is_interface()));
				check!(!value2.ty.map_or(false, |ty| ty.is_interface()));
			}

			StackType::Ref => check!(Self::category(&value2) == StackType::Ref),

			StackType::ValueType => check_fail!(),
		}

		Ok((code, value1_reg, value2_reg))
	}

	fn lower_compare(&mut self, code: MirInsnCode) -> Result<()> {
		let wk = self.registry.well_known();
		let value2 = self.stack_pop()?;
		let value1 = self.stack_pop()?;
		let result_reg = self.stack_push(Some(wk.int32))?;

		let (code, value1_reg, value2_reg) =
			self.coerce_comparison(code, value1, value2, [MirInsnCode::Eq, MirInsnCode::Eq])?;
		self.append(code, vec![reg(result_reg), reg(value1_reg), reg(value2_reg)]);
		Ok(())
	}

	fn lower_compare_branch(&mut self, code: MirInsnCode, il_offset: u32, il_target: u32) -> Result<()> {
		let value2 = self.stack_pop()?;
		let value1 = self.stack_pop()?;
		let label = self.branch_point(il_offset, il_target)?;

		let (code, value1_reg, value2_reg) =
			self.coerce_comparison(code, value1, value2, [MirInsnCode::Beq, MirInsnCode::Bne])?;
		self.append(code, vec![lbl(label), reg(value1_reg), reg(value2_reg)]);
		Ok(())
	}

	/// Builds the two-word interface slot at the address in `result_reg`
	/// from the object in `from_reg`: the vtable-slice pointer of the
	/// implemented interface, then the instance itself (through the write
	/// barrier matching the destination).
	fn cast_obj_to_interface(
		&mut self,
		result_reg: MirReg,
		from_reg: MirReg,
		from_type: &'l Type<'l>,
		to_type: &'l Type<'l>,
		store: InterfaceStore,
	) -> Result<()> {
		let wk = self.registry.well_known();
		let interface = from_type.interface_impl(to_type);
		let Some(interface) = interface else {
			check_fail!("`{from_type}` does not implement `{to_type}`");
		};

		// &vtable->virtual_functions[impl.vtable_offset]
		let vtable_reg = self.new_reg(Some(wk.intptr));
		self.append(MirInsnCode::Mov, vec![reg(vtable_reg), MirOp::mem(MirType::P, 0, from_reg)]);
		self.append(
			MirInsnCode::Add,
			vec![
				reg(vtable_reg),
				reg(vtable_reg),
				int(VTABLE_VIRTUAL_FUNCTIONS_OFFSET + interface.vtable_offset as i64 * 8),
			],
		);
		self.append(MirInsnCode::Mov, vec![MirOp::mem(MirType::P, 0, result_reg), reg(vtable_reg)]);

		match store {
			InterfaceStore::Plain => {
				self.append(MirInsnCode::Mov, vec![MirOp::mem(MirType::P, 8, result_reg), reg(from_reg)]);
			}
			InterfaceStore::Object { owner, offset } => {
				let (proto, func) = self.runtime.gc_update;
				self.append(MirInsnCode::Call, vec![item(proto), item(func), reg(owner), offset, reg(from_reg)]);
			}
			InterfaceStore::Ref => {
				let addr = self.new_reg(Some(wk.intptr));
				self.append(MirInsnCode::Add, vec![reg(addr), reg(result_reg), int(8)]);
				let (proto, func) = self.runtime.gc_update_ref;
				self.append(MirInsnCode::Call, vec![item(proto), item(func), reg(addr), reg(from_reg)]);
			}
		}
		Ok(())
	}

	//------------------------------------------------------------------------------------------------------------------
	// Locals and arguments
	//------------------------------------------------------------------------------------------------------------------

	fn lower_stloc(&mut self, index: usize) -> Result<()> {
		let value = self.stack_pop()?;
		let local_type = self.local_type(index)?;
		let variable_type = self.registry.intermediate_type(local_type);
		check!(self.registry.is_verifier_assignable_to(value.ty, Some(variable_type)));
		let local_reg = self.locals[index];

		match Self::category(&value) {
			StackType::O => {
				let value_is_interface = value.ty.map_or(false, |ty| ty.is_interface());
				if variable_type.is_interface() {
					match value_is_interface {
						// interface -> interface
						true => self.emit_memcpy(local_reg, value.reg, variable_type.stack_size.get()),
						// object -> interface
						false => self.cast_obj_to_interface(
							local_reg,
							value.reg,
							value.ty.ok_or(JitError::CheckFailed)?,
							variable_type,
							InterfaceStore::Plain,
						)?,
					}
				} else if value_is_interface {
					// interface -> object, take the instance word
					self.append(MirInsnCode::Mov, vec![reg(local_reg), MirOp::mem(MirType::P, 8, value.reg)]);
				} else {
					let code = self.number_cast_inscode(value.ty, variable_type);
					self.append(code, vec![reg(local_reg), reg(value.reg)]);
				}
			}

			StackType::Int32 | StackType::Int64 | StackType::IntPtr | StackType::Float | StackType::Ref => {
				let code = self.number_cast_inscode(value.ty, variable_type);
				self.append(code, vec![reg(local_reg), reg(value.reg)]);
			}

			StackType::ValueType => {
				let size = value.ty.ok_or(JitError::CheckFailed)?.stack_size.get();
				self.emit_memcpy(local_reg, value.reg, size);
			}
		}
		Ok(())
	}

	fn lower_ldloc(&mut self, index: usize) -> Result<()> {
		let local_type = self.local_type(index)?;
		let value_type = self.registry.intermediate_type(local_type);
		let local_reg = self.locals[index];
		let value_reg = self.stack_push(Some(value_type))?;

		match value_type.stack_type.get() {
			StackType::O if value_type.is_interface() => {
				self.emit_memcpy(value_reg, local_reg, value_type.stack_size.get());
			}
			StackType::ValueType => {
				self.emit_memcpy(value_reg, local_reg, value_type.stack_size.get());
			}
			_ => {
				let code = self.number_inscode(Some(value_type));
				self.append(code, vec![reg(value_reg), reg(local_reg)]);
			}
		}
		Ok(())
	}

	fn lower_ldloca(&mut self, index: usize) -> Result<()> {
		let local_type = self.local_type(index)?;
		let value_type = self.registry.by_ref_type_of(self.registry.verification_type(local_type))?;
		let local_reg = self.locals[index];
		let value_reg = self.stack_push(Some(value_type))?;

		match local_type.stack_type.get() {
			// block-backed locals already live in memory, their register is
			// the address
			StackType::ValueType => {
				self.append(MirInsnCode::Mov, vec![reg(value_reg), reg(local_reg)]);
			}
			StackType::O if local_type.is_interface() => {
				self.append(MirInsnCode::Mov, vec![reg(value_reg), reg(local_reg)]);
			}
			_ => check_fail!("TODO: spill register locals before taking their address"),
		}
		Ok(())
	}

	fn lower_ldarg(&mut self, index: u32) -> Result<()> {
		let method = self.current_method()?;
		let mut index = index;
		let mut arg_name = None;
		let mut arg_type = None;

		if !method.is_static() {
			if index == 0 {
				let declaring = method.declaring_type.get().ok_or(JitError::NotFound)?;
				arg_name = Some("this".to_string());
				// value types see their receiver through a managed reference
				arg_type = Some(match declaring.is_value_type.get() {
					true => self.registry.by_ref_type_of(declaring)?,
					false => declaring,
				});
			}
			index = index.wrapping_sub(1);
		}

		let arg_name = arg_name.unwrap_or_else(|| format!("arg{index}"));
		let arg_type = match arg_type {
			Some(ty) => ty,
			None => {
				let parameters = method.parameters.borrow();
				check!((index as usize) < parameters.len());
				parameters[index as usize]
			}
		};

		let arg_reg = self.arg_reg(&arg_name)?;
		let stack_type = self.registry.intermediate_type(arg_type);
		let value_reg = self.stack_push(Some(stack_type))?;

		match stack_type.stack_type.get() {
			StackType::O if stack_type.is_interface() => {
				self.emit_memcpy(value_reg, arg_reg, stack_type.stack_size.get());
			}
			StackType::ValueType => {
				self.emit_memcpy(value_reg, arg_reg, stack_type.stack_size.get());
			}
			_ => {
				let code = self.number_inscode(Some(stack_type));
				self.append(code, vec![reg(value_reg), reg(arg_reg)]);
			}
		}
		Ok(())
	}

	fn lower_ldc_i4(&mut self, value: i32) -> Result<()> {
		let wk = self.registry.well_known();
		let value_reg = self.stack_push(Some(wk.int32))?;
		self.append(MirInsnCode::Mov, vec![reg(value_reg), int(value as i64)]);
		Ok(())
	}

	//------------------------------------------------------------------------------------------------------------------
	// Conversions
	//------------------------------------------------------------------------------------------------------------------

	fn lower_conv(&mut self, op: OpCode<'l>) -> Result<()> {
		let wk = self.registry.well_known();
		let value = self.stack_pop()?;
		let mut value_reg = value.reg;

		let result_type = match op {
			OpCode::conv_i1 | OpCode::conv_u1 | OpCode::conv_i2 | OpCode::conv_u2 | OpCode::conv_i4 | OpCode::conv_u4 => wk.int32,
			OpCode::conv_i8 | OpCode::conv_u8 => wk.int64,
			OpCode::conv_i | OpCode::conv_u => wk.intptr,
			OpCode::conv_r4 => wk.single,
			OpCode::conv_r8 => wk.double,
			_ => check_fail!(),
		};
		let result_reg = self.stack_push(Some(result_type))?;

		let code = match Self::category(&value) {
			StackType::Int32 => match op {
				OpCode::conv_i1 => MirInsnCode::Ext8,
				OpCode::conv_u1 => MirInsnCode::UExt8,
				OpCode::conv_i2 => MirInsnCode::Ext16,
				OpCode::conv_u2 => MirInsnCode::UExt16,
				OpCode::conv_i4 | OpCode::conv_u4 => MirInsnCode::Mov,
				OpCode::conv_i8 | OpCode::conv_i => MirInsnCode::Ext32,
				OpCode::conv_u8 | OpCode::conv_u => MirInsnCode::UExt32,
				OpCode::conv_r4 => MirInsnCode::I2F,
				OpCode::conv_r8 => MirInsnCode::I2D,
				_ => check_fail!(),
			},

			StackType::IntPtr | StackType::Int64 => match op {
				OpCode::conv_i1 => MirInsnCode::Ext8,
				OpCode::conv_u1 => MirInsnCode::UExt8,
				OpCode::conv_i2 => MirInsnCode::Ext16,
				OpCode::conv_u2 => MirInsnCode::UExt16,
				OpCode::conv_i4 => MirInsnCode::Ext32,
				OpCode::conv_u4 => MirInsnCode::UExt32,
				OpCode::conv_i8 | OpCode::conv_u8 | OpCode::conv_i | OpCode::conv_u => MirInsnCode::Mov,
				OpCode::conv_r4 => MirInsnCode::I2F,
				OpCode::conv_r8 => MirInsnCode::I2D,
				_ => check_fail!(),
			},

			StackType::Float => {
				let from_single = value.ty == Some(wk.single);
				let to_int = if from_single { MirInsnCode::F2I } else { MirInsnCode::D2I };
				if result_type.stack_type.get() == StackType::Int32 {
					// float to small int converts to native int first, then
					// truncates
					self.append(to_int, vec![reg(result_reg), reg(value_reg)]);
					value_reg = result_reg;
				}
				match op {
					OpCode::conv_i1 => MirInsnCode::Ext8,
					OpCode::conv_u1 => MirInsnCode::UExt8,
					OpCode::conv_i2 => MirInsnCode::Ext16,
					OpCode::conv_u2 => MirInsnCode::UExt16,
					OpCode::conv_i4 => MirInsnCode::Ext32,
					OpCode::conv_u4 => MirInsnCode::UExt32,
					OpCode::conv_i8 | OpCode::conv_u8 | OpCode::conv_i | OpCode::conv_u => to_int,
					OpCode::conv_r4 => match from_single {
						true => MirInsnCode::FMov,
						false => MirInsnCode::D2F,
					},
					OpCode::conv_r8 => match from_single {
						true => MirInsnCode::F2D,
						false => MirInsnCode::DMov,
					},
					_ => check_fail!(),
				}
			}

			StackType::O | StackType::ValueType | StackType::Ref => check_fail!(),
		};

		self.append(code, vec![reg(result_reg), reg(value_reg)]);
		Ok(())
	}

	//------------------------------------------------------------------------------------------------------------------
	// Calls
	//------------------------------------------------------------------------------------------------------------------

	fn lower_call(&mut self, kind: CallKind, token: MetadataToken, il_offset: u32) -> Result<()> {
		let wk = self.registry.well_known();
		let operand_method = self.resolve_method(token)?;
		let return_type = operand_method.return_type.get();
		let parameters = operand_method.parameters.borrow().clone();
		let arg_count = parameters.len();
		let aggressive_inlining = operand_method.is_aggressive_inlining();

		match kind {
			CallKind::NewObj => {
				// constructors are vetted by the loader
				check!(operand_method.is_rt_special_name());
				check!(operand_method.name == ".ctor");
			}
			CallKind::CallVirt => check!(!operand_method.is_static()),
			CallKind::Call => check!(!operand_method.is_abstract()),
		}

		// op layout: proto, callee, exception result, value result (if any),
		// this (if any), then the arguments
		let mut other_args = 3usize;
		if return_type.is_some() {
			other_args += 1;
		}
		if !operand_method.is_static() {
			other_args += 1;
		}
		let mut arg_ops = vec![int(0); other_args + arg_count];

		// pop and coerce the arguments in reverse
		for i in (other_args..other_args + arg_count).rev() {
			let signature_type = parameters[i - other_args];
			let arg = self.stack_pop()?;
			let mut arg_type = arg.ty;
			let mut arg_reg = arg.reg;

			if arg_type == Some(wk.int32) {
				if [wk.sbyte, wk.byte, wk.boolean, wk.int16, wk.uint16].contains(&signature_type) {
					// truncation happens in the callee's typed load
					arg_type = Some(signature_type);
				} else if signature_type == wk.intptr {
					self.append(MirInsnCode::Ext32, vec![reg(arg_reg), reg(arg_reg)]);
					arg_type = Some(signature_type);
				} else if signature_type == wk.uintptr {
					self.append(MirInsnCode::UExt32, vec![reg(arg_reg), reg(arg_reg)]);
					arg_type = Some(signature_type);
				}
			} else if arg_type == Some(wk.intptr) {
				if self.registry.is_integer(signature_type) {
					arg_type = Some(signature_type);
				}
			} else if arg_type == Some(wk.single) {
				if signature_type == wk.double {
					let promoted = self.new_reg(Some(wk.double));
					self.append(MirInsnCode::F2D, vec![reg(promoted), reg(arg_reg)]);
					arg_reg = promoted;
					arg_type = Some(signature_type);
				}
			} else if arg_type == Some(wk.double) {
				if signature_type == wk.single {
					let demoted = self.new_reg(Some(wk.single));
					self.append(MirInsnCode::D2F, vec![reg(demoted), reg(arg_reg)]);
					arg_reg = demoted;
					arg_type = Some(signature_type);
				}
			}

			arg_ops[i] = reg(arg_reg);
			check!(self.registry.is_verifier_assignable_to(arg_type, Some(signature_type)));
		}

		// the receiver
		let mut number_reg = None;
		let mut this_reg = MirReg(0);
		let mut this_type = None;
		if !operand_method.is_static() {
			let declaring = operand_method.declaring_type.get().ok_or(JitError::NotFound)?;
			if kind == CallKind::NewObj {
				check!(!declaring.is_abstract());
				check!(!declaring.is_interface());

				this_reg = self.stack_push(Some(declaring))?;
				this_type = Some(declaring);

				if declaring.is_value_type.get() {
					if declaring.stack_type.get() != StackType::ValueType {
						// a primitive-shaped struct: construct it in a
						// scratch block and copy the value out afterwards
						number_reg = Some(this_reg);
						let scratch = self.new_reg(Some(wk.intptr));
						let func = self.func.ok_or(JitError::CheckFailed)?;
						self.module.func_mut(func).prepend(MirInsn::new(
							MirInsnCode::Alloca,
							vec![reg(scratch), int(declaring.stack_size.get() as i64)],
						));
						this_reg = scratch;
					}
					self.emit_zerofill(this_reg, declaring.stack_size.get());
				} else {
					self.emit_new(this_reg, declaring, int(declaring.managed_size.get() as i64), il_offset)?;
				}
			} else {
				let this = self.stack_pop()?;
				this_reg = this.reg;
				this_type = this.ty;

				let expected = match declaring.is_value_type.get() {
					true => self.registry.by_ref_type_of(declaring)?,
					false => declaring,
				};
				check!(self.registry.is_verifier_assignable_to(this_type, Some(expected)));
				self.null_check(il_offset, this_reg, this_type)?;
			}
			arg_ops[other_args - 1] = reg(this_reg);
		}

		let entry = self.function_entry(operand_method)?;
		arg_ops[0] = item(entry.proto);

		if kind == CallKind::CallVirt && operand_method.is_virtual() {
			// dynamic dispatch through the receiver's vtable
			let this_ty = this_type.ok_or(JitError::CheckFailed)?;
			let temp_reg = self.new_reg(Some(wk.type_type));

			// the vtable pointer is the first word of both objects and
			// interface slots
			self.append(MirInsnCode::Mov, vec![reg(temp_reg), MirOp::mem(MirType::P, 0, this_reg)]);

			let declaring = operand_method.declaring_type.get().ok_or(JitError::NotFound)?;
			let (offset, vtable_index) = if this_ty.is_interface() {
				// the slot slice starts right at the interface's vtable
				// pointer; unwrap the instance for the call itself
				self.append(MirInsnCode::Mov, vec![reg(this_reg), MirOp::mem(MirType::P, 8, this_reg)]);
				(0i64, operand_method.vtable_offset.get().ok_or(JitError::NotFound)?)
			} else if declaring.is_interface() {
				let interface = this_ty.interface_impl(declaring).ok_or(JitError::NotFound)?;
				let index = interface.vtable_offset + operand_method.vtable_offset.get().ok_or(JitError::NotFound)?;
				(VTABLE_VIRTUAL_FUNCTIONS_OFFSET, index)
			} else {
				(VTABLE_VIRTUAL_FUNCTIONS_OFFSET, operand_method.vtable_offset.get().ok_or(JitError::NotFound)?)
			};

			self.append(
				MirInsnCode::Mov,
				vec![reg(temp_reg), MirOp::mem(MirType::P, offset + vtable_index as i64 * 8, temp_reg)],
			);
			arg_ops[1] = reg(temp_reg);
		} else {
			arg_ops[1] = item(entry.forward.ok_or(JitError::NotFound)?);
		}

		arg_ops[2] = reg(self.exception_reg);

		let call_code = match aggressive_inlining {
			true => MirInsnCode::Inline,
			false => MirInsnCode::Call,
		};
		if let Some(return_type) = return_type {
			let ret_reg = self.stack_push(Some(self.registry.intermediate_type(return_type)))?;
			// a block-typed result is covered by the address the push just
			// allocated, the call writes through it
			arg_ops[3] = reg(ret_reg);
		}
		self.append(call_code, arg_ops);

		// route any in-flight exception to its handler
		let no_exception = self.new_label();
		self.append(MirInsnCode::Bf, vec![lbl(no_exception), reg(self.exception_reg)]);
		self.throw(il_offset, None)?;
		self.append_label(no_exception);

		// a primitive-shaped struct constructed in the scratch block is
		// copied onto the evaluation stack
		if kind == CallKind::NewObj {
			let declaring = operand_method.declaring_type.get().ok_or(JitError::NotFound)?;
			if declaring.is_value_type.get() && declaring.stack_type.get() != StackType::ValueType {
				let code = self.number_inscode(Some(declaring));
				let mem = MirOp::mem(self.mir_type(declaring), 0, this_reg);
				self.append(code, vec![reg(number_reg.ok_or(JitError::CheckFailed)?), mem]);
			}
		}
		Ok(())
	}

	//------------------------------------------------------------------------------------------------------------------
	// Casting and boxing
	//------------------------------------------------------------------------------------------------------------------

	fn lower_cast(&mut self, kind: CastKind, operand_type: &'l Type<'l>, il_offset: u32) -> Result<()> {
		let wk = self.registry.well_known();
		let obj = self.stack_pop()?;

		if matches!(kind, CastKind::IsInst | CastKind::CastClass) {
			// the target must be a reference type, and the downcast must at
			// least be possible
			check!(operand_type.stack_type.get() == StackType::O);
			check!(obj.ty.is_none() || self.registry.is_verifier_assignable_to(Some(operand_type), obj.ty));
		}
		check!(obj.ty.map_or(true, |ty| ty.stack_type.get() == StackType::O));

		let obj2_reg = self.stack_push(Some(operand_type))?;
		let cast_result_reg = self.new_reg(Some(wk.boolean));
		let type_ref = self.type_item(operand_type)?;
		let cast_success = self.new_label();

		// an interface source narrows to its instance word first
		if obj.ty.map_or(false, |ty| ty.is_interface()) {
			self.append(MirInsnCode::Mov, vec![reg(obj.reg), MirOp::mem(MirType::P, 8, obj.reg)]);
		}

		if operand_type.is_interface() {
			let (proto, func) = self.runtime.dynamic_cast_obj_to_interface;
			self.append(
				MirInsnCode::Call,
				vec![item(proto), item(func), reg(cast_result_reg), reg(obj2_reg), reg(obj.reg), item(type_ref)],
			);
		} else {
			let (proto, func) = self.runtime.is_instance;
			self.append(
				MirInsnCode::Call,
				vec![item(proto), item(func), reg(cast_result_reg), reg(obj.reg), item(type_ref)],
			);
		}

		self.append(MirInsnCode::Bt, vec![lbl(cast_success), reg(cast_result_reg)]);

		match kind {
			CastKind::IsInst => {
				// the interface helper already zeroed its slot on failure
				if !operand_type.is_interface() {
					self.append(MirInsnCode::Mov, vec![reg(obj.reg), int(0)]);
				}
			}
			CastKind::CastClass | CastKind::UnboxAny => {
				self.throw_new(il_offset, wk.invalid_cast_exception)?;
			}
		}

		self.append_label(cast_success);

		match operand_type.stack_type.get() {
			StackType::O => {
				if !operand_type.is_interface() {
					self.append(MirInsnCode::Mov, vec![reg(obj2_reg), reg(obj.reg)]);
				}
			}

			StackType::Int32 | StackType::IntPtr | StackType::Int64 | StackType::Float => {
				// unbox the payload behind the object header
				let code = self.number_inscode(Some(operand_type));
				let mem = MirOp::mem(self.mir_type(operand_type), wk.object.managed_size.get() as i64, obj.reg);
				self.append(code, vec![reg(obj2_reg), mem]);
			}

			StackType::ValueType => {
				self.append(
					MirInsnCode::Add,
					vec![reg(obj.reg), reg(obj.reg), int(wk.object.managed_size.get() as i64)],
				);
				self.emit_memcpy(obj2_reg, obj.reg, operand_type.managed_size.get());
			}

			StackType::Ref => check_fail!(),
		}
		Ok(())
	}

	fn lower_box(&mut self, operand_type: &'l Type<'l>, il_offset: u32) -> Result<()> {
		let wk = self.registry.well_known();
		let value = self.stack_pop()?;
		check!(self.registry.is_verifier_assignable_to(value.ty, Some(operand_type)));

		let obj_reg = self.stack_push(Some(wk.object))?;

		if operand_type.is_value_type.get() {
			let size = wk.object.managed_size.get() + operand_type.managed_size.get();
			self.emit_new(obj_reg, operand_type, int(size as i64), il_offset)?;
		}

		match operand_type.stack_type.get() {
			// boxing a reference is the identity
			StackType::O => {
				self.append(MirInsnCode::Mov, vec![reg(obj_reg), reg(value.reg)]);
			}

			StackType::Int32 | StackType::IntPtr | StackType::Int64 | StackType::Float => {
				let code = self.number_inscode(Some(operand_type));
				let mem = MirOp::mem(self.mir_type(operand_type), wk.object.managed_size.get() as i64, obj_reg);
				self.append(code, vec![mem, reg(value.reg)]);
			}

			StackType::ValueType => {
				self.append(
					MirInsnCode::Add,
					vec![reg(obj_reg), reg(obj_reg), int(wk.object.managed_size.get() as i64)],
				);
				self.emit_memcpy(obj_reg, value.reg, operand_type.managed_size.get());
			}

			StackType::Ref => check_fail!(),
		}
		Ok(())
	}

	//------------------------------------------------------------------------------------------------------------------
	// Arrays
	//------------------------------------------------------------------------------------------------------------------

	fn lower_stelem(&mut self, operand_type: Option<&'l Type<'l>>, il_offset: u32) -> Result<()> {
		let value = self.stack_pop()?;
		let index = self.stack_pop()?;
		let array = self.stack_pop()?;

		let array_type = array.ty.ok_or(JitError::CheckFailed)?;
		check!(array_type.is_array.get());
		let element_type = array_type.element_type.get().ok_or(JitError::NotFound)?;

		// stelem.ref stores whatever the array holds
		let operand_type = operand_type.unwrap_or(element_type);

		match value.ty {
			Some(value_type) => check!(self
				.registry
				.is_array_element_compatible_with(value_type, self.registry.intermediate_type(operand_type))),
			None => check!(operand_type.is_object_ref()),
		}
		check!(self.registry.is_array_element_compatible_with(operand_type, element_type));

		match Self::category(&index) {
			StackType::Int32 => self.append(MirInsnCode::Ext32, vec![reg(index.reg), reg(index.reg)]),
			StackType::IntPtr => {}
			_ => check_fail!(),
		}

		self.null_check(il_offset, array.reg, array.ty)?;
		self.oob_check(il_offset, array.reg, index.reg)?;

		match Self::category(&value) {
			StackType::O => {
				let value_is_interface = value.ty.map_or(false, |ty| ty.is_interface());
				if operand_type.is_interface() {
					if value_is_interface {
						check_fail!("TODO: interface value store into an array");
					}

					// scale the index into the element's byte offset
					self.append(
						MirInsnCode::Mul,
						vec![reg(index.reg), reg(index.reg), int(operand_type.stack_size.get() as i64)],
					);
					self.append(
						MirInsnCode::Add,
						vec![reg(index.reg), reg(index.reg), int(self.array_data_offset())],
					);

					// build the slot in place, barrier on the instance word
					let wk = self.registry.well_known();
					let slot_reg = self.new_reg(Some(wk.intptr));
					self.append(MirInsnCode::Add, vec![reg(slot_reg), reg(index.reg), reg(array.reg)]);
					let offset_reg = self.new_reg(Some(wk.intptr));
					self.append(MirInsnCode::Add, vec![reg(offset_reg), reg(index.reg), int(8)]);
					self.cast_obj_to_interface(
						slot_reg,
						value.reg,
						value.ty.ok_or(JitError::CheckFailed)?,
						operand_type,
						InterfaceStore::Object { owner: array.reg, offset: reg(offset_reg) },
					)?;
				} else {
					if value_is_interface {
						self.append(MirInsnCode::Mov, vec![reg(value.reg), MirOp::mem(MirType::P, 8, value.reg)]);
					}

					self.append(
						MirInsnCode::Mul,
						vec![reg(index.reg), reg(index.reg), int(operand_type.stack_size.get() as i64)],
					);
					self.append(
						MirInsnCode::Add,
						vec![reg(index.reg), reg(index.reg), int(self.array_data_offset())],
					);

					// reference store into the heap goes through the barrier
					let (proto, func) = self.runtime.gc_update;
					self.append(
						MirInsnCode::Call,
						vec![item(proto), item(func), reg(array.reg), reg(index.reg), reg(value.reg)],
					);
				}
			}

			StackType::Int32 | StackType::Int64 | StackType::IntPtr | StackType::Float => {
				let code = self.number_cast_inscode(value.ty, operand_type);
				let mem = MirOp::mem_indexed(
					self.mir_type(operand_type),
					self.array_data_offset(),
					array.reg,
					index.reg,
					operand_type.stack_size.get(),
				);
				self.append(code, vec![mem, reg(value.reg)]);
			}

			StackType::ValueType => check_fail!("TODO: struct value store into an array"),

			StackType::Ref => check_fail!(),
		}
		Ok(())
	}

	fn lower_ldelem(&mut self, operand_type: Option<&'l Type<'l>>, il_offset: u32) -> Result<()> {
		let index = self.stack_pop()?;
		let array = self.stack_pop()?;

		let array_type = array.ty.ok_or(JitError::CheckFailed)?;
		check!(array_type.is_array.get());
		let element_type = array_type.element_type.get().ok_or(JitError::NotFound)?;

		let operand_type = match operand_type {
			Some(ty) => {
				check!(self.registry.is_array_element_compatible_with(element_type, ty));
				ty
			}
			None => element_type,
		};

		match Self::category(&index) {
			StackType::Int32 => self.append(MirInsnCode::Ext32, vec![reg(index.reg), reg(index.reg)]),
			StackType::IntPtr => {}
			_ => check_fail!(),
		}

		self.null_check(il_offset, array.reg, array.ty)?;
		self.oob_check(il_offset, array.reg, index.reg)?;

		let value_reg = self.stack_push(Some(self.registry.intermediate_type(operand_type)))?;

		match operand_type.stack_type.get() {
			StackType::O if operand_type.is_interface() => {
				check_fail!("TODO: interface value load from an array")
			}

			StackType::Int32 | StackType::Int64 | StackType::IntPtr | StackType::Float | StackType::O => {
				let code = self.load_extend_inscode(operand_type);
				let mem = MirOp::mem_indexed(
					self.mir_type(operand_type),
					self.array_data_offset(),
					array.reg,
					index.reg,
					operand_type.stack_size.get(),
				);
				self.append(code, vec![reg(value_reg), mem]);
			}

			StackType::ValueType => check_fail!("TODO: struct value load from an array"),

			StackType::Ref => check_fail!(),
		}
		Ok(())
	}

	fn lower_ldelema(&mut self, operand_type: &'l Type<'l>, il_offset: u32) -> Result<()> {
		let index = self.stack_pop()?;
		let array = self.stack_pop()?;

		let array_type = array.ty.ok_or(JitError::CheckFailed)?;
		check!(array_type.is_array.get());
		let element_type = array_type.element_type.get().ok_or(JitError::NotFound)?;
		check!(self.registry.is_array_element_compatible_with(element_type, operand_type));

		match Self::category(&index) {
			StackType::Int32 => self.append(MirInsnCode::Ext32, vec![reg(index.reg), reg(index.reg)]),
			StackType::IntPtr => {}
			_ => check_fail!(),
		}

		self.null_check(il_offset, array.reg, array.ty)?;
		self.oob_check(il_offset, array.reg, index.reg)?;

		let intermediate = self.registry.intermediate_type(operand_type);
		let by_ref = self.registry.by_ref_type_of(intermediate)?;
		let value_reg = self.stack_push(Some(by_ref))?;

		self.append(
			MirInsnCode::Mul,
			vec![reg(value_reg), reg(index.reg), int(operand_type.stack_size.get() as i64)],
		);
		self.append(MirInsnCode::Add, vec![reg(value_reg), reg(value_reg), int(self.array_data_offset())]);
		self.append(MirInsnCode::Add, vec![reg(value_reg), reg(value_reg), reg(array.reg)]);
		Ok(())
	}

	/// Loads narrower than the 32-bit stack width extend to honour the
	/// stack rule; Char and the unsigned forms zero-extend.
	fn load_extend_inscode(&self, ty: &'l Type<'l>) -> MirInsnCode {
		let wk = self.registry.well_known();
		match ty {
			t if t == wk.sbyte || t == wk.boolean => MirInsnCode::Ext8,
			t if t == wk.byte => MirInsnCode::UExt8,
			t if t == wk.int16 => MirInsnCode::Ext16,
			t if t == wk.uint16 || t == wk.char => MirInsnCode::UExt16,
			t if t == wk.single => MirInsnCode::FMov,
			t if t == wk.double => MirInsnCode::DMov,
			_ => MirInsnCode::Mov,
		}
	}

	//------------------------------------------------------------------------------------------------------------------
	// Fields
	//------------------------------------------------------------------------------------------------------------------

	fn lower_stsfld(&mut self, token: MetadataToken) -> Result<()> {
		let field = self.resolve_field(token)?;
		let value = self.stack_pop()?;
		let field_type = self.registry.underlying_type(field.field_type.get());

		check!(field.is_static());
		// init-only statics may only be written by the declaring type's
		// runtime-special-name members
		if field.is_init_only() {
			check!(self.current_method()?.is_rt_special_name());
		}
		check!(self.registry.is_verifier_assignable_to(value.ty, Some(field.field_type.get())));

		let entry = *self.static_fields.get(&field).ok_or(JitError::NotFound)?;
		let wk = self.registry.well_known();
		let field_reg = self.new_reg(Some(wk.intptr));
		self.append(MirInsnCode::Mov, vec![reg(field_reg), item(entry.item)]);
		let field_op = MirOp::mem(self.mir_type(field_type), 0, field_reg);

		match Self::category(&value) {
			StackType::O => {
				let value_is_interface = value.ty.map_or(false, |ty| ty.is_interface());
				if field_type.is_interface() {
					match value_is_interface {
						true => self.emit_memcpy(field_reg, value.reg, field_type.stack_size.get()),
						false => self.cast_obj_to_interface(
							field_reg,
							value.reg,
							value.ty.ok_or(JitError::CheckFailed)?,
							field_type,
							InterfaceStore::Plain,
						)?,
					}
				} else if value_is_interface {
					self.append(MirInsnCode::Mov, vec![field_op, MirOp::mem(MirType::P, 8, value.reg)]);
				} else {
					let code = self.number_cast_inscode(value.ty, field_type);
					self.append(code, vec![field_op, reg(value.reg)]);
				}
			}

			StackType::Int32 | StackType::Int64 | StackType::IntPtr | StackType::Float | StackType::Ref => {
				let code = self.number_cast_inscode(value.ty, field_type);
				self.append(code, vec![field_op, reg(value.reg)]);
			}

			StackType::ValueType => {
				let size = value.ty.ok_or(JitError::CheckFailed)?.stack_size.get();
				self.emit_memcpy(field_reg, value.reg, size);
			}
		}
		Ok(())
	}

	fn lower_ldsfld(&mut self, token: MetadataToken) -> Result<()> {
		let field = self.resolve_field(token)?;
		check!(field.is_static());

		let field_stack_type = self.registry.intermediate_type(field.field_type.get());
		let field_type = self.registry.underlying_type(field.field_type.get());
		let value_reg = self.stack_push(Some(field_stack_type))?;

		let entry = *self.static_fields.get(&field).ok_or(JitError::NotFound)?;
		let wk = self.registry.well_known();
		let field_reg = self.new_reg(Some(wk.intptr));
		self.append(MirInsnCode::Mov, vec![reg(field_reg), item(entry.item)]);
		let field_op = MirOp::mem(self.mir_type(field_type), 0, field_reg);

		match field_type.stack_type.get() {
			StackType::O if field_type.is_interface() => {
				self.emit_memcpy(value_reg, field_reg, field_type.stack_size.get());
			}

			StackType::O | StackType::Int32 | StackType::Int64 | StackType::IntPtr | StackType::Float => {
				let code = self.load_extend_inscode(field_type);
				self.append(code, vec![reg(value_reg), field_op]);
			}

			StackType::ValueType => {
				self.emit_memcpy(value_reg, field_reg, field_type.stack_size.get());
			}

			StackType::Ref => check_fail!(),
		}
		Ok(())
	}

	fn lower_ldsflda(&mut self, token: MetadataToken) -> Result<()> {
		let field = self.resolve_field(token)?;
		check!(field.is_static());

		let verification_type = self.registry.verification_type(field.field_type.get());
		let field_stack_type = self.registry.by_ref_type_of(verification_type)?;
		let entry = *self.static_fields.get(&field).ok_or(JitError::NotFound)?;

		let value_reg = self.stack_push(Some(field_stack_type))?;
		self.append(MirInsnCode::Mov, vec![reg(value_reg), item(entry.item)]);
		Ok(())
	}

	fn lower_stfld(&mut self, token: MetadataToken, il_offset: u32) -> Result<()> {
		let field = self.resolve_field(token)?;
		let value = self.stack_pop()?;
		let obj = self.stack_pop()?;
		let obj_type = obj.ty.ok_or(JitError::CheckFailed)?;
		let declaring = field.declaring_type.get().ok_or(JitError::NotFound)?;

		// the receiver is an object, or a managed reference to a value type
		// (whose containing object, if any, is unknown)
		let obj_is_ref = obj_type.stack_type.get() == StackType::Ref;
		if obj_is_ref {
			check!(obj_type.base_type.get().map_or(false, |base| base.is_value_type.get()));
		} else {
			check!(obj_type.stack_type.get() == StackType::O);
		}
		check!(obj_type.base_chain().any(|base| base == declaring));
		check!(!field.is_static());
		if field.is_init_only() {
			check!(self.current_method()?.is_rt_special_name());
		}

		if obj_type.stack_type.get() == StackType::O {
			self.null_check(il_offset, obj.reg, obj.ty)?;
		}

		let field_type = self.registry.underlying_type(field.field_type.get());
		let field_offset = field.memory_offset.get() as i64;
		check!(self.registry.is_verifier_assignable_to(value.ty, Some(field.field_type.get())));

		match Self::category(&value) {
			StackType::O => {
				let value_is_interface = value.ty.map_or(false, |ty| ty.is_interface());
				if field_type.is_interface() {
					if value_is_interface {
						// interface -> interface, copy the slot in place
						self.append(MirInsnCode::Add, vec![reg(obj.reg), reg(obj.reg), int(field_offset)]);
						self.emit_memcpy(obj.reg, value.reg, field_type.stack_size.get());
					} else {
						let wk = self.registry.well_known();
						let slot_reg = self.new_reg(Some(wk.intptr));
						self.append(MirInsnCode::Add, vec![reg(slot_reg), reg(obj.reg), int(field_offset)]);
						let store = match obj_is_ref {
							true => InterfaceStore::Ref,
							false => InterfaceStore::Object { owner: obj.reg, offset: int(field_offset + 8) },
						};
						self.cast_obj_to_interface(
							slot_reg,
							value.reg,
							value.ty.ok_or(JitError::CheckFailed)?,
							field_type,
							store,
						)?;
					}
				} else {
					// an interface value narrows to its instance word first
					if value_is_interface {
						self.append(MirInsnCode::Mov, vec![reg(value.reg), MirOp::mem(MirType::P, 8, value.reg)]);
					}

					if !obj_is_ref {
						let (proto, func) = self.runtime.gc_update;
						self.append(
							MirInsnCode::Call,
							vec![item(proto), item(func), reg(obj.reg), int(field_offset), reg(value.reg)],
						);
					} else {
						self.append(MirInsnCode::Add, vec![reg(obj.reg), reg(obj.reg), int(field_offset)]);
						let (proto, func) = self.runtime.gc_update_ref;
						self.append(MirInsnCode::Call, vec![item(proto), item(func), reg(obj.reg), reg(value.reg)]);
					}
				}
			}

			StackType::Int32 | StackType::Int64 | StackType::IntPtr | StackType::Float => {
				let code = self.number_cast_inscode(value.ty, field_type);
				let mem = MirOp::mem(self.mir_type(field.field_type.get()), field_offset, obj.reg);
				self.append(code, vec![mem, reg(value.reg)]);
			}

			StackType::ValueType => {
				let value_type = value.ty.ok_or(JitError::CheckFailed)?;
				if value_type.managed_pointers_offsets.borrow().is_empty() {
					// no managed references inside, a plain copy is enough
					self.append(MirInsnCode::Add, vec![reg(obj.reg), reg(obj.reg), int(field_offset)]);
					self.emit_memcpy(obj.reg, value.reg, value_type.stack_size.get());
				} else {
					let type_item = self.type_item(field_type)?;
					if !obj_is_ref {
						let (proto, func) = self.runtime.managed_memcpy;
						self.append(
							MirInsnCode::Call,
							vec![
								item(proto),
								item(func),
								reg(obj.reg),
								item(type_item),
								int(field_offset),
								reg(value.reg),
							],
						);
					} else {
						self.append(MirInsnCode::Add, vec![reg(obj.reg), reg(obj.reg), int(field_offset)]);
						let (proto, func) = self.runtime.managed_ref_memcpy;
						self.append(
							MirInsnCode::Call,
							vec![item(proto), item(func), reg(obj.reg), item(type_item), reg(value.reg)],
						);
					}
				}
			}

			StackType::Ref => check_fail!("there is no such thing as a ref field"),
		}
		Ok(())
	}

	fn lower_ldfld(&mut self, token: MetadataToken, il_offset: u32) -> Result<()> {
		let field = self.resolve_field(token)?;
		let obj = self.stack_pop()?;
		let obj_type = obj.ty.ok_or(JitError::CheckFailed)?;
		let declaring = field.declaring_type.get().ok_or(JitError::NotFound)?;

		if obj_type.stack_type.get() == StackType::Ref {
			let base = obj_type.base_type.get().ok_or(JitError::CheckFailed)?;
			check!(base.stack_type.get() == StackType::ValueType);
		} else {
			check!(matches!(obj_type.stack_type.get(), StackType::O | StackType::ValueType));
		}
		check!(obj_type.base_chain().any(|base| base == declaring));
		check!(!field.is_static());
		check!(self.registry.is_compatible_with(obj_type, declaring));

		let field_stack_type = self.registry.intermediate_type(field.field_type.get());
		let field_type = self.registry.underlying_type(field.field_type.get());
		let field_offset = field.memory_offset.get() as i64;
		let value_reg = self.stack_push(Some(field_stack_type))?;

		if obj_type.stack_type.get() == StackType::O {
			self.null_check(il_offset, obj.reg, obj.ty)?;
		}

		match field_type.stack_type.get() {
			StackType::O if field_type.is_interface() => {
				self.append(MirInsnCode::Add, vec![reg(obj.reg), reg(obj.reg), int(field_offset)]);
				self.emit_memcpy(value_reg, obj.reg, field_type.stack_size.get());
			}

			StackType::O | StackType::Int32 | StackType::Int64 | StackType::IntPtr | StackType::Float => {
				let code = self.load_extend_inscode(field_type);
				let mem = MirOp::mem(self.mir_type(field.field_type.get()), field_offset, obj.reg);
				self.append(code, vec![reg(value_reg), mem]);
			}

			StackType::ValueType => {
				self.append(MirInsnCode::Add, vec![reg(obj.reg), reg(obj.reg), int(field_offset)]);
				self.emit_memcpy(value_reg, obj.reg, field_type.stack_size.get());
			}

			StackType::Ref => check_fail!(),
		}
		Ok(())
	}

	fn lower_ldflda(&mut self, token: MetadataToken, il_offset: u32) -> Result<()> {
		let field = self.resolve_field(token)?;
		let obj = self.stack_pop()?;
		let obj_type = obj.ty.ok_or(JitError::CheckFailed)?;
		let declaring = field.declaring_type.get().ok_or(JitError::NotFound)?;

		check!(matches!(obj_type.stack_type.get(), StackType::O | StackType::Ref));
		check!(obj_type.base_chain().any(|base| base == declaring));
		check!(!field.is_static());
		check!(self.registry.is_compatible_with(obj_type, declaring));

		let verification_type = self.registry.verification_type(field.field_type.get());
		let field_stack_type = self.registry.by_ref_type_of(verification_type)?;
		let value_reg = self.stack_push(Some(field_stack_type))?;

		if obj_type.stack_type.get() == StackType::O {
			self.null_check(il_offset, obj.reg, obj.ty)?;
		}

		self.append(
			MirInsnCode::Add,
			vec![reg(value_reg), reg(obj.reg), int(field.memory_offset.get() as i64)],
		);
		Ok(())
	}

	//------------------------------------------------------------------------------------------------------------------
	// Exception control flow
	//------------------------------------------------------------------------------------------------------------------

	fn lower_leave(&mut self, il_offset: u32, il_target: u32) -> Result<()> {
		let target_label = self.resolve_branch(il_offset, il_target)?;
		let clauses = self.clause_list();

		// chain every containing finally: each jumps to the next, the last
		// one continues at the leave target
		let mut last_clause: Option<usize> = None;
		let mut in_protected_block = false;

		for (i, clause) in clauses.iter().enumerate() {
			if clause.handler_contains(il_offset) {
				// leaving a handler means the exception has been consumed
				in_protected_block = true;
				self.append(MirInsnCode::Mov, vec![reg(self.exception_reg), int(0)]);
			}

			if !clause.try_contains(il_offset) {
				continue;
			}
			in_protected_block = true;

			if !matches!(clause.kind, ClauseKind::Finally) {
				continue;
			}

			let finally_label = self.clauses[i].label;
			self.clauses[i].endfinally = Some(target_label);
			self.clauses[i].last_in_chain = true;

			match last_clause {
				None => self.append(MirInsnCode::Jmp, vec![lbl(finally_label)]),
				Some(previous) => {
					self.clauses[previous].endfinally = Some(finally_label);
					self.clauses[previous].last_in_chain = false;
				}
			}
			last_clause = Some(i);
		}

		check!(in_protected_block);

		if last_clause.is_none() {
			self.append(MirInsnCode::Jmp, vec![lbl(target_label)]);
		}
		Ok(())
	}

	fn lower_endfinally(&mut self, il_offset: u32) -> Result<()> {
		let clauses = self.clause_list();
		for (i, clause) in clauses.iter().enumerate() {
			if !clause.handler_contains(il_offset) {
				continue;
			}
			check!(matches!(clause.kind, ClauseKind::Finally));

			let labels = self.clauses[i];
			let Some(endfinally_label) = labels.endfinally else {
				check_fail!();
			};

			if labels.last_in_chain {
				// an exception still in flight after the last finally
				// re-propagates out of the method
				let skip = self.new_label();
				self.append(MirInsnCode::Bf, vec![lbl(skip), reg(self.exception_reg)]);
				let nres = self.method_nres(self.current_method()?);
				let mut ops = vec![reg(self.exception_reg)];
				if nres == 2 {
					ops.push(int(0));
				}
				self.append(MirInsnCode::Ret, ops);
				self.append_label(skip);
			}

			self.append(MirInsnCode::Jmp, vec![lbl(endfinally_label)]);
			return Ok(());
		}
		check_fail!()
	}

	//------------------------------------------------------------------------------------------------------------------
	// Return
	//------------------------------------------------------------------------------------------------------------------

	fn lower_ret(&mut self) -> Result<()> {
		let method = self.current_method()?;
		let Some(declared_ret) = method.return_type.get() else {
			check!(self.stack.is_empty());
			self.append(MirInsnCode::Ret, vec![int(0)]);
			return Ok(());
		};

		let method_ret_type = self.registry.underlying_type(declared_ret);
		let ret = self.stack_pop()?;
		check!(self.stack.is_empty());
		check!(self.registry.is_verifier_assignable_to(ret.ty, Some(declared_ret)));

		match Self::category(&ret) {
			StackType::O => {
				let ret_is_interface = ret.ty.map_or(false, |ty| ty.is_interface());
				if method_ret_type.is_interface() {
					if ret_is_interface {
						// interface -> interface, copy the slot out
						let return_block = self.return_block.ok_or(JitError::CheckFailed)?;
						let size = ret.ty.ok_or(JitError::CheckFailed)?.stack_size.get();
						self.emit_memcpy(return_block, ret.reg, size);
						self.append(MirInsnCode::Ret, vec![int(0)]);
					} else {
						let return_block = self.return_block.ok_or(JitError::CheckFailed)?;
						self.cast_obj_to_interface(
							return_block,
							ret.reg,
							ret.ty.ok_or(JitError::CheckFailed)?,
							method_ret_type,
							InterfaceStore::Plain,
						)?;
						self.append(MirInsnCode::Ret, vec![int(0)]);
					}
				} else if ret_is_interface {
					self.append(MirInsnCode::Ret, vec![int(0), MirOp::mem(MirType::P, 8, ret.reg)]);
				} else {
					self.append(MirInsnCode::Ret, vec![int(0), reg(ret.reg)]);
				}
			}

			StackType::Int32 | StackType::Int64 | StackType::IntPtr | StackType::Float => {
				self.append(MirInsnCode::Ret, vec![int(0), reg(ret.reg)]);
			}

			StackType::ValueType => {
				let return_block = self.return_block.ok_or(JitError::CheckFailed)?;
				let size = ret.ty.ok_or(JitError::CheckFailed)?.stack_size.get();
				self.emit_memcpy(return_block, ret.reg, size);
				self.append(MirInsnCode::Ret, vec![int(0)]);
			}

			StackType::Ref => check_fail!(),
		}
		Ok(())
	}

	//------------------------------------------------------------------------------------------------------------------
	// Method translation
	//------------------------------------------------------------------------------------------------------------------

	#[tracing::instrument(skip_all, fields(method = %method))]
	pub fn compile_method(&mut self, method: &'l Method<'l>) -> Result<()> {
		let wk = self.registry.well_known();
		self.method = Some(method);
		self.name_gen = 0;
		self.stack.clear();
		self.snapshots.clear();
		self.clauses.clear();
		self.locals.clear();
		self.return_block = None;

		let body = method.body.borrow().clone().ok_or(JitError::BadFormat)?;
		let code = body.code;
		let clause_list = body.exception_clauses.clone();
		let local_types = body.locals.clone();
		let func_name = method.to_string();

		// the function signature mirrors the prepared prototype
		let mut results = vec![MirType::P];
		let mut vars = vec![];
		let mut has_return_block = false;
		if let Some(ret) = method.return_type.get() {
			match self.mir_type(ret) {
				MirType::Blk(_) => {
					vars.push(MirVar::new("return_block", MirType::P));
					has_return_block = true;
				}
				other => results.push(other),
			}
		}
		if !method.is_static() {
			let declaring = method.declaring_type.get().ok_or(JitError::NotFound)?;
			let this_type = match self.mir_type(declaring) {
				MirType::Blk(_) => MirType::P,
				other => other,
			};
			vars.push(MirVar::new("this", this_type));
		}
		for (i, parameter) in method.parameters.borrow().iter().enumerate() {
			vars.push(MirVar::new(format!("arg{i}"), self.mir_type(parameter)));
		}

		let func = self.module.new_func(&func_name, results, vars);
		self.func = Some(func);
		method.mir_func.set(Some(func));
		self.body = Some(body);

		self.exception_reg = self.module.func_mut(func).new_reg("exception", MirType::I64);
		if has_return_block {
			self.return_block = Some(self.arg_reg("return_block")?);
		}

		// locals are mandatorily initialised; the zeroing form follows the
		// local's register class
		for &local_type in &local_types {
			check!(self.body.as_ref().map_or(false, |body| body.init_locals));
			let local_reg = self.new_reg(Some(local_type));
			self.locals.push(local_reg);

			match local_type.stack_type.get() {
				StackType::O if local_type.is_interface() => self.emit_zerofill(local_reg, local_type.stack_size.get()),
				StackType::O | StackType::Int32 | StackType::Int64 | StackType::IntPtr | StackType::Ref => {
					self.append(MirInsnCode::Mov, vec![reg(local_reg), int(0)]);
				}
				StackType::Float => match local_type == wk.single {
					true => self.append(MirInsnCode::FMov, vec![reg(local_reg), MirOp::Float(0.0)]),
					false => self.append(MirInsnCode::DMov, vec![reg(local_reg), MirOp::Double(0.0)]),
				},
				StackType::ValueType => self.emit_zerofill(local_reg, local_type.stack_size.get()),
			}
		}

		// handler entries get their labels and entry stacks up front; catch
		// handlers start with the caught exception as their single slot
		for clause in &clause_list {
			check!(!matches!(clause.kind, ClauseKind::Filter { .. }));
			let label = self.module.func_mut(func).new_label();
			let mut stack = vec![];
			if let ClauseKind::Catch(catch_type) = clause.kind {
				let slot_reg = self.new_reg(Some(catch_type));
				stack.push(StackSlot { ty: Some(catch_type), reg: slot_reg });
			}
			self.snapshots.insert(clause.handler_offset, StackSnapshot { stack, label });
			self.clauses.push(ClauseLabels { label, endfinally: None, last_in_chain: false });
		}

		let mut last_cf: Option<ControlFlow> = None;
		let mut iterator = OpCodeIterator::new(code);
		while let Some((il_offset, op)) = iterator.next() {
			let op = op.map_err(|_| JitError::BadFormat)?;
			let next_offset = iterator.position();

			// after a branch or a throw the next instruction inherits no
			// stack: it either owns a snapshot or starts empty
			let have_snapshot = self.snapshots.contains_key(&il_offset);
			if matches!(last_cf, Some(ControlFlow::Branch | ControlFlow::Throw)) {
				match have_snapshot {
					false => self.stack.clear(),
					true => self.stack_copy_from(il_offset),
				}
			}

			let current_label = if have_snapshot {
				self.stack_merge(il_offset, true)?;
				self.snapshots[&il_offset].label
			} else {
				let label = self.new_label();
				let snapshot = StackSnapshot { stack: self.stack_snapshot(), label };
				self.snapshots.insert(il_offset, snapshot);
				label
			};
			self.append_label(current_label);

			// protected-region boundaries are only reachable through
			// explicit control transfers, never by falling in or out
			for clause in &clause_list {
				if clause.handler_offset == il_offset
					|| clause.handler_offset + clause.handler_length == il_offset
					|| clause.try_offset + clause.try_length == il_offset
				{
					check!(matches!(
						last_cf,
						Some(ControlFlow::Branch | ControlFlow::Throw | ControlFlow::Return)
					));
				}
			}

			last_cf = Some(op.effective_control_flow());

			match op {
				OpCode::nop => {}

				//------------------------------------------------------------------------------------------------------
				// Arithmetic
				//------------------------------------------------------------------------------------------------------

				OpCode::add => self.lower_binary(il_offset, MirInsnCode::Add, false)?,
				OpCode::sub => self.lower_binary(il_offset, MirInsnCode::Sub, false)?,
				OpCode::mul => self.lower_binary(il_offset, MirInsnCode::Mul, false)?,
				OpCode::div => self.lower_binary(il_offset, MirInsnCode::Div, false)?,
				OpCode::div_un => self.lower_binary(il_offset, MirInsnCode::UDiv, true)?,
				OpCode::rem => self.lower_binary(il_offset, MirInsnCode::Mod, false)?,
				OpCode::rem_un => self.lower_binary(il_offset, MirInsnCode::UMod, true)?,
				OpCode::and => self.lower_binary(il_offset, MirInsnCode::And, true)?,
				OpCode::or => self.lower_binary(il_offset, MirInsnCode::Or, true)?,
				OpCode::xor => self.lower_binary(il_offset, MirInsnCode::Xor, true)?,

				OpCode::neg => {
					let value = self.stack_pop()?;
					let result_reg = self.stack_push(value.ty)?;
					let code = match Self::category(&value) {
						StackType::Int32 => MirInsnCode::NegS,
						StackType::Int64 | StackType::IntPtr => MirInsnCode::Neg,
						StackType::Float => match value.ty == Some(wk.single) {
							true => MirInsnCode::FNeg,
							false => MirInsnCode::DNeg,
						},
						_ => check_fail!(),
					};
					self.append(code, vec![reg(result_reg), reg(value.reg)]);
				}

				OpCode::not => {
					let value = self.stack_pop()?;
					let result_reg = self.stack_push(value.ty)?;
					let code = match Self::category(&value) {
						StackType::Int32 => MirInsnCode::XorS,
						StackType::Int64 | StackType::IntPtr => MirInsnCode::Xor,
						_ => check_fail!(),
					};
					// ~value == value ^ -1
					self.append(code, vec![reg(result_reg), reg(value.reg), int(-1)]);
				}

				OpCode::conv_i1 | OpCode::conv_i2 | OpCode::conv_i4 | OpCode::conv_i8 | OpCode::conv_r4
				| OpCode::conv_r8 | OpCode::conv_u1 | OpCode::conv_u2 | OpCode::conv_u4 | OpCode::conv_u8
				| OpCode::conv_i | OpCode::conv_u => self.lower_conv(op)?,

				//------------------------------------------------------------------------------------------------------
				// Variables
				//------------------------------------------------------------------------------------------------------

				OpCode::stloc_0 => self.lower_stloc(0)?,
				OpCode::stloc_1 => self.lower_stloc(1)?,
				OpCode::stloc_2 => self.lower_stloc(2)?,
				OpCode::stloc_3 => self.lower_stloc(3)?,
				OpCode::stloc_s(index) => self.lower_stloc(index as usize)?,

				OpCode::ldloc_0 => self.lower_ldloc(0)?,
				OpCode::ldloc_1 => self.lower_ldloc(1)?,
				OpCode::ldloc_2 => self.lower_ldloc(2)?,
				OpCode::ldloc_3 => self.lower_ldloc(3)?,
				OpCode::ldloc_s(index) => self.lower_ldloc(index as usize)?,

				OpCode::ldloca_s(index) => self.lower_ldloca(index as usize)?,

				//------------------------------------------------------------------------------------------------------
				// Arguments
				//------------------------------------------------------------------------------------------------------

				OpCode::ldarg_0 => self.lower_ldarg(0)?,
				OpCode::ldarg_1 => self.lower_ldarg(1)?,
				OpCode::ldarg_2 => self.lower_ldarg(2)?,
				OpCode::ldarg_3 => self.lower_ldarg(3)?,
				OpCode::ldarg_s(index) => self.lower_ldarg(index as u32)?,

				//------------------------------------------------------------------------------------------------------
				// Basic stack manipulation
				//------------------------------------------------------------------------------------------------------

				OpCode::ldc_i4_m1 => self.lower_ldc_i4(-1)?,
				OpCode::ldc_i4_0 => self.lower_ldc_i4(0)?,
				OpCode::ldc_i4_1 => self.lower_ldc_i4(1)?,
				OpCode::ldc_i4_2 => self.lower_ldc_i4(2)?,
				OpCode::ldc_i4_3 => self.lower_ldc_i4(3)?,
				OpCode::ldc_i4_4 => self.lower_ldc_i4(4)?,
				OpCode::ldc_i4_5 => self.lower_ldc_i4(5)?,
				OpCode::ldc_i4_6 => self.lower_ldc_i4(6)?,
				OpCode::ldc_i4_7 => self.lower_ldc_i4(7)?,
				OpCode::ldc_i4_8 => self.lower_ldc_i4(8)?,
				OpCode::ldc_i4_s(value) => self.lower_ldc_i4(value as i32)?,
				OpCode::ldc_i4(value) => self.lower_ldc_i4(value)?,

				OpCode::ldc_i8(value) => {
					let value_reg = self.stack_push(Some(wk.int64))?;
					self.append(MirInsnCode::Mov, vec![reg(value_reg), int(value)]);
				}

				OpCode::ldc_r4(value) => {
					let value_reg = self.stack_push(Some(wk.single))?;
					self.append(MirInsnCode::FMov, vec![reg(value_reg), MirOp::Float(value)]);
				}

				OpCode::ldc_r8(value) => {
					let value_reg = self.stack_push(Some(wk.double))?;
					self.append(MirInsnCode::DMov, vec![reg(value_reg), MirOp::Double(value)]);
				}

				OpCode::ldstr(token) => {
					self.assembly.string_by_token(token)?;
					let string_item = *self
						.strings
						.get(&(token.index() as u32))
						.ok_or(JitError::NotFound)?;
					let string_reg = self.stack_push(Some(wk.string))?;
					self.append(MirInsnCode::Mov, vec![reg(string_reg), item(string_item)]);
				}

				OpCode::ldnull => {
					let null_reg = self.stack_push(None)?;
					self.append(MirInsnCode::Mov, vec![reg(null_reg), int(0)]);
				}

				OpCode::dup => {
					let top = self.stack_pop()?;
					let value_1 = self.stack_push(top.ty)?;
					let value_2 = self.stack_push(top.ty)?;

					match Self::category(&top) {
						StackType::O if top.ty.map_or(false, |ty| ty.is_interface()) => {
							self.append(MirInsnCode::Mov, vec![reg(value_1), reg(top.reg)]);
							let size = top.ty.ok_or(JitError::CheckFailed)?.stack_size.get();
							self.emit_memcpy(value_2, value_1, size);
						}
						StackType::ValueType => {
							self.append(MirInsnCode::Mov, vec![reg(value_1), reg(top.reg)]);
							let size = top.ty.ok_or(JitError::CheckFailed)?.stack_size.get();
							self.emit_memcpy(value_2, value_1, size);
						}
						_ => {
							let code = self.number_inscode(top.ty);
							self.append(code, vec![reg(value_1), reg(top.reg)]);
							self.append(code, vec![reg(value_2), reg(top.reg)]);
						}
					}
				}

				OpCode::pop => {
					self.stack_pop()?;
				}

				//------------------------------------------------------------------------------------------------------
				// Field access
				//------------------------------------------------------------------------------------------------------

				OpCode::stsfld(token) => self.lower_stsfld(token)?,
				OpCode::ldsfld(token) => self.lower_ldsfld(token)?,
				OpCode::ldsflda(token) => self.lower_ldsflda(token)?,
				OpCode::stfld(token) => self.lower_stfld(token, il_offset)?,
				OpCode::ldfld(token) => self.lower_ldfld(token, il_offset)?,
				OpCode::ldflda(token) => self.lower_ldflda(token, il_offset)?,

				//------------------------------------------------------------------------------------------------------
				// Calls and returns
				//------------------------------------------------------------------------------------------------------

				OpCode::call(token) => self.lower_call(CallKind::Call, token, il_offset)?,
				OpCode::callvirt(token) => self.lower_call(CallKind::CallVirt, token, il_offset)?,
				OpCode::newobj(token) => self.lower_call(CallKind::NewObj, token, il_offset)?,

				OpCode::ret => self.lower_ret()?,

				//------------------------------------------------------------------------------------------------------
				// Casting and boxing
				//------------------------------------------------------------------------------------------------------

				OpCode::isinst(token) => {
					let ty = self.resolve_type(token)?;
					self.lower_cast(CastKind::IsInst, ty, il_offset)?;
				}
				OpCode::castclass(token) => {
					let ty = self.resolve_type(token)?;
					self.lower_cast(CastKind::CastClass, ty, il_offset)?;
				}
				OpCode::unbox_any(token) => {
					let ty = self.resolve_type(token)?;
					self.lower_cast(CastKind::UnboxAny, ty, il_offset)?;
				}
				OpCode::box_val(token) => {
					let ty = self.resolve_type(token)?;
					self.lower_box(ty, il_offset)?;
				}

				//------------------------------------------------------------------------------------------------------
				// Arrays
				//------------------------------------------------------------------------------------------------------

				OpCode::newarr(token) => {
					let operand_type = self.resolve_type(token)?;
					let num_elems = self.stack_pop()?;
					check!(num_elems.ty == Some(wk.int32));

					let array_type = self.registry.array_type_of(operand_type);
					let array_reg = self.stack_push(Some(array_type))?;

					// num_elems * sizeof(element) + sizeof(System.Array)
					let size_reg = self.new_reg(Some(wk.int64));
					self.append(
						MirInsnCode::Mul,
						vec![reg(size_reg), reg(num_elems.reg), int(operand_type.stack_size.get() as i64)],
					);
					self.append(
						MirInsnCode::Add,
						vec![reg(size_reg), reg(size_reg), int(self.array_data_offset())],
					);

					self.emit_new(array_reg, array_type, reg(size_reg), il_offset)?;

					self.append(
						MirInsnCode::Mov,
						vec![
							MirOp::mem(MirType::I32, self.array_length_offset(), array_reg),
							reg(num_elems.reg),
						],
					);
				}

				OpCode::ldlen => {
					let array = self.stack_pop()?;
					let array_type = array.ty.ok_or(JitError::CheckFailed)?;
					check!(array_type.is_array.get());
					self.null_check(il_offset, array.reg, array.ty)?;

					let length_reg = self.stack_push(Some(wk.intptr))?;
					self.append(
						MirInsnCode::Mov,
						vec![reg(length_reg), MirOp::mem(MirType::I32, self.array_length_offset(), array.reg)],
					);
				}

				OpCode::stelem_i1 => self.lower_stelem(Some(wk.sbyte), il_offset)?,
				OpCode::stelem_i2 => self.lower_stelem(Some(wk.int16), il_offset)?,
				OpCode::stelem_i4 => self.lower_stelem(Some(wk.int32), il_offset)?,
				OpCode::stelem_i8 => self.lower_stelem(Some(wk.int64), il_offset)?,
				OpCode::stelem_r4 => self.lower_stelem(Some(wk.single), il_offset)?,
				OpCode::stelem_r8 => self.lower_stelem(Some(wk.double), il_offset)?,
				OpCode::stelem_i => self.lower_stelem(Some(wk.intptr), il_offset)?,
				OpCode::stelem_ref => self.lower_stelem(None, il_offset)?,
				OpCode::stelem(token) => {
					let ty = self.resolve_type(token)?;
					self.lower_stelem(Some(ty), il_offset)?;
				}

				OpCode::ldelem_i1 => self.lower_ldelem(Some(wk.sbyte), il_offset)?,
				OpCode::ldelem_u1 => self.lower_ldelem(Some(wk.byte), il_offset)?,
				OpCode::ldelem_i2 => self.lower_ldelem(Some(wk.int16), il_offset)?,
				OpCode::ldelem_u2 => self.lower_ldelem(Some(wk.uint16), il_offset)?,
				OpCode::ldelem_i4 => self.lower_ldelem(Some(wk.int32), il_offset)?,
				OpCode::ldelem_u4 => self.lower_ldelem(Some(wk.uint32), il_offset)?,
				OpCode::ldelem_i8 => self.lower_ldelem(Some(wk.int64), il_offset)?,
				OpCode::ldelem_r4 => self.lower_ldelem(Some(wk.single), il_offset)?,
				OpCode::ldelem_r8 => self.lower_ldelem(Some(wk.double), il_offset)?,
				OpCode::ldelem_i => self.lower_ldelem(Some(wk.intptr), il_offset)?,
				OpCode::ldelem_ref => self.lower_ldelem(None, il_offset)?,
				OpCode::ldelem(token) => {
					let ty = self.resolve_type(token)?;
					self.lower_ldelem(Some(ty), il_offset)?;
				}

				OpCode::ldelema(token) => {
					let ty = self.resolve_type(token)?;
					self.lower_ldelema(ty, il_offset)?;
				}

				//------------------------------------------------------------------------------------------------------
				// Branches
				//------------------------------------------------------------------------------------------------------

				OpCode::br(disp) => {
					let target = self.target_of(next_offset, disp)?;
					let label = self.branch_point(il_offset, target)?;
					self.append(MirInsnCode::Jmp, vec![lbl(label)]);
				}
				OpCode::br_s(disp) => {
					let target = self.target_of(next_offset, disp as i32)?;
					let label = self.branch_point(il_offset, target)?;
					self.append(MirInsnCode::Jmp, vec![lbl(label)]);
				}

				OpCode::brfalse(disp) | OpCode::brtrue(disp) => {
					let target = self.target_of(next_offset, disp)?;
					let truthy = matches!(op, OpCode::brtrue(_));
					self.lower_branch_on_value(truthy, il_offset, target)?;
				}
				OpCode::brfalse_s(disp) | OpCode::brtrue_s(disp) => {
					let target = self.target_of(next_offset, disp as i32)?;
					let truthy = matches!(op, OpCode::brtrue_s(_));
					self.lower_branch_on_value(truthy, il_offset, target)?;
				}

				OpCode::beq(disp) => self.lower_compare_branch_disp(MirInsnCode::Beq, il_offset, next_offset, disp)?,
				OpCode::beq_s(disp) => self.lower_compare_branch_disp(MirInsnCode::Beq, il_offset, next_offset, disp as i32)?,
				OpCode::bge(disp) => self.lower_compare_branch_disp(MirInsnCode::Bge, il_offset, next_offset, disp)?,
				OpCode::bge_s(disp) => self.lower_compare_branch_disp(MirInsnCode::Bge, il_offset, next_offset, disp as i32)?,
				OpCode::bgt(disp) => self.lower_compare_branch_disp(MirInsnCode::Bgt, il_offset, next_offset, disp)?,
				OpCode::bgt_s(disp) => self.lower_compare_branch_disp(MirInsnCode::Bgt, il_offset, next_offset, disp as i32)?,
				OpCode::ble(disp) => self.lower_compare_branch_disp(MirInsnCode::Ble, il_offset, next_offset, disp)?,
				OpCode::ble_s(disp) => self.lower_compare_branch_disp(MirInsnCode::Ble, il_offset, next_offset, disp as i32)?,
				OpCode::blt(disp) => self.lower_compare_branch_disp(MirInsnCode::Blt, il_offset, next_offset, disp)?,
				OpCode::blt_s(disp) => self.lower_compare_branch_disp(MirInsnCode::Blt, il_offset, next_offset, disp as i32)?,
				OpCode::bne_un(disp) => self.lower_compare_branch_disp(MirInsnCode::Bne, il_offset, next_offset, disp)?,
				OpCode::bne_un_s(disp) => self.lower_compare_branch_disp(MirInsnCode::Bne, il_offset, next_offset, disp as i32)?,
				OpCode::bge_un(disp) => self.lower_compare_branch_disp(MirInsnCode::UBge, il_offset, next_offset, disp)?,
				OpCode::bge_un_s(disp) => self.lower_compare_branch_disp(MirInsnCode::UBge, il_offset, next_offset, disp as i32)?,
				OpCode::bgt_un(disp) => self.lower_compare_branch_disp(MirInsnCode::UBgt, il_offset, next_offset, disp)?,
				OpCode::bgt_un_s(disp) => self.lower_compare_branch_disp(MirInsnCode::UBgt, il_offset, next_offset, disp as i32)?,
				OpCode::ble_un(disp) => self.lower_compare_branch_disp(MirInsnCode::UBle, il_offset, next_offset, disp)?,
				OpCode::ble_un_s(disp) => self.lower_compare_branch_disp(MirInsnCode::UBle, il_offset, next_offset, disp as i32)?,
				OpCode::blt_un(disp) => self.lower_compare_branch_disp(MirInsnCode::UBlt, il_offset, next_offset, disp)?,
				OpCode::blt_un_s(disp) => self.lower_compare_branch_disp(MirInsnCode::UBlt, il_offset, next_offset, disp as i32)?,

				OpCode::switch(table) => {
					let value = self.stack_pop()?;
					let selector_category = Self::category(&value);

					let mut switch_ops = Vec::with_capacity(table.len() + 1);
					switch_ops.push(reg(value.reg));
					for disp in table.targets() {
						let target = self.target_of(next_offset, disp)?;
						let label = self.branch_point(il_offset, target)?;
						switch_ops.push(lbl(label));
					}

					// out-of-range selectors, negative included, fall through
					let not_taken = self.new_label();
					let guard = match selector_category {
						StackType::Int32 => MirInsnCode::UBge.int32(),
						_ => MirInsnCode::UBge,
					};
					self.append(guard, vec![lbl(not_taken), reg(value.reg), int(table.len() as i64)]);
					self.append(MirInsnCode::Switch, switch_ops);
					self.append_label(not_taken);
				}

				//------------------------------------------------------------------------------------------------------
				// Exception control flow
				//------------------------------------------------------------------------------------------------------

				OpCode::throw => {
					let obj = self.stack_pop()?;
					// the rest of the operand stack dies with the transfer
					self.stack.clear();
					self.null_check(il_offset, obj.reg, obj.ty)?;
					self.append(MirInsnCode::Mov, vec![reg(self.exception_reg), reg(obj.reg)]);
					self.throw(il_offset, obj.ty)?;
				}

				OpCode::leave(disp) => {
					let target = self.target_of(next_offset, disp)?;
					self.lower_leave(il_offset, target)?;
				}
				OpCode::leave_s(disp) => {
					let target = self.target_of(next_offset, disp as i32)?;
					self.lower_leave(il_offset, target)?;
				}

				OpCode::endfinally => self.lower_endfinally(il_offset)?,

				//------------------------------------------------------------------------------------------------------
				// Two-byte opcodes
				//------------------------------------------------------------------------------------------------------

				OpCode::compound(compound) => match compound {
					CompoundOpCode::ceq => self.lower_compare(MirInsnCode::Eq)?,
					CompoundOpCode::cgt => self.lower_compare(MirInsnCode::Gt)?,
					CompoundOpCode::cgt_un => self.lower_compare(MirInsnCode::UGt)?,
					CompoundOpCode::clt => self.lower_compare(MirInsnCode::Lt)?,
					CompoundOpCode::clt_un => self.lower_compare(MirInsnCode::ULt)?,

					CompoundOpCode::ldarg(index) => self.lower_ldarg(index as u32)?,
					CompoundOpCode::ldloc(index) => self.lower_ldloc(index as usize)?,
					CompoundOpCode::stloc(index) => self.lower_stloc(index as usize)?,
					CompoundOpCode::ldloca(index) => self.lower_ldloca(index as usize)?,

					CompoundOpCode::initobj(token) => {
						let operand_type = self.resolve_type(token)?;
						let dest = self.stack_pop()?;
						let dest_type = dest.ty.ok_or(JitError::CheckFailed)?;
						check!(dest_type.is_by_ref.get());
						let base = dest_type.base_type.get().ok_or(JitError::CheckFailed)?;
						check!(base.stack_type.get() == StackType::ValueType);
						check!(self.registry.is_verifier_assignable_to(Some(operand_type), Some(base)));
						self.emit_zerofill(dest.reg, operand_type.stack_size.get());
					}

					other => check_fail!("unsupported opcode {other:?}"),
				},

				other => check_fail!("unsupported opcode {other:?}"),
			}
		}

		// the body may not run off its end
		check!(matches!(
			last_cf,
			Some(ControlFlow::Branch | ControlFlow::Throw | ControlFlow::Return)
		));

		self.method = None;
		self.body = None;
		self.func = None;
		Ok(())
	}

	fn lower_branch_on_value(&mut self, truthy: bool, il_offset: u32, il_target: u32) -> Result<()> {
		let value = self.stack_pop()?;
		let label = self.branch_point(il_offset, il_target)?;

		let mut code = match truthy {
			true => MirInsnCode::Bt,
			false => MirInsnCode::Bf,
		};
		match Self::category(&value) {
			StackType::Int32 => code = code.int32(),
			StackType::IntPtr | StackType::Int64 | StackType::Ref | StackType::O => {}
			StackType::ValueType | StackType::Float => check_fail!(),
		}
		self.append(code, vec![lbl(label), reg(value.reg)]);
		Ok(())
	}

	fn lower_compare_branch_disp(
		&mut self,
		code: MirInsnCode,
		il_offset: u32,
		next_offset: u32,
		displacement: i32,
	) -> Result<()> {
		let target = self.target_of(next_offset, displacement)?;
		self.lower_compare_branch(code, il_offset, target)
	}
}
