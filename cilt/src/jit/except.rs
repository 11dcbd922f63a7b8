//! Protected-region dispatch: the throw/leave/endfinally machinery and the
//! runtime checks (null, bounds, OOM) that reduce to it.

use crate::errors::{JitError, Result};
use crate::mir::{MirInsnCode, MirOp, MirReg, MirType};
use crate::model::{ClauseKind, Type};
use crate::utilities::{check, check_fail};

use super::context::JitContext;
use super::{int, item, lbl, reg};

impl<'l> JitContext<'l> {
	/// Emits the jump into a handler. Catch handlers receive the in-flight
	/// exception in the single slot their entry snapshot tracks.
	pub fn jump_to_exception_clause(&mut self, clause_index: usize) -> Result<()> {
		let labels = *self.clauses.get(clause_index).ok_or(JitError::NotFound)?;
		let clause = {
			let body = self.body.as_ref().ok_or(JitError::CheckFailed)?;
			*body.exception_clauses.get(clause_index).ok_or(JitError::NotFound)?
		};

		if let Some(catch_type) = clause.catch_type() {
			let slot = {
				let snapshot = self.snapshots.get(&clause.handler_offset).ok_or(JitError::CheckFailed)?;
				check!(snapshot.stack.len() == 1);
				check!(snapshot.stack[0].ty == Some(catch_type));
				snapshot.stack[0].reg
			};
			self.append(MirInsnCode::Mov, vec![reg(slot), reg(self.exception_reg)]);
		}

		self.append(MirInsnCode::Jmp, vec![lbl(labels.label)]);
		Ok(())
	}

	/// Dispatches the exception held in the exception register. Clauses are
	/// walked in declaration order; a statically-typed throw matches catch
	/// types through the base chain, an unknown throw emits a runtime
	/// `isinstance` check per candidate clause. With no applicable clause
	/// the method returns, propagating through the exception result slot.
	pub fn throw(&mut self, il_offset: u32, ty: Option<&'l Type<'l>>) -> Result<()> {
		check!(ty.map_or(true, |t| t.is_object_ref()));

		let wk = self.registry.well_known();
		let clauses = self.clause_list();
		let mut temp_reg = None;
		let mut selected = None;

		for (i, clause) in clauses.iter().enumerate() {
			if !clause.try_contains(il_offset) {
				continue;
			}

			match clause.kind {
				ClauseKind::Finally | ClauseKind::Fault => {
					selected = Some(i);
					break;
				}
				ClauseKind::Catch(catch_type) => match ty {
					Some(thrown) => {
						if thrown.base_chain().any(|base| base == catch_type) {
							selected = Some(i);
							break;
						}
					}
					None => {
						// unknown static type, test the candidate at runtime
						let temp = match temp_reg {
							Some(temp) => temp,
							None => {
								let temp = self.new_reg(Some(wk.boolean));
								temp_reg = Some(temp);
								temp
							}
						};
						let type_ref = self.type_item(catch_type)?;
						let skip = self.new_label();

						let (proto, func) = self.runtime.is_instance;
						self.append(
							MirInsnCode::Call,
							vec![item(proto), item(func), reg(temp), reg(self.exception_reg), item(type_ref)],
						);
						self.append(MirInsnCode::Bf, vec![lbl(skip), reg(temp)]);
						self.jump_to_exception_clause(i)?;
						self.append_label(skip);
					}
				},
				ClauseKind::Filter { .. } => check_fail!("filter clauses are not supported"),
			}
		}

		match selected {
			Some(clause_index) => self.jump_to_exception_clause(clause_index)?,
			None => {
				let nres = self.method_nres(self.current_method()?);
				let mut ops = vec![reg(self.exception_reg)];
				if nres == 2 {
					ops.push(int(0));
				}
				self.append(MirInsnCode::Ret, ops);
			}
		}
		Ok(())
	}

	/// Allocates, constructs and throws an exception of type `ty` through
	/// its parameterless constructor. An exception escaping the constructor
	/// itself is rethrown with unknown type.
	pub fn throw_new(&mut self, il_offset: u32, ty: &'l Type<'l>) -> Result<()> {
		let ctor = ty.methods.borrow().iter().copied().find(|method| {
			!method.is_static()
				&& method.is_special_name()
				&& method.is_rt_special_name()
				&& method.name == ".ctor"
				&& method.parameters.borrow().is_empty()
				&& method.return_type.get().is_none()
		});
		let Some(ctor) = ctor else {
			check_fail!("`{ty}` has no parameterless constructor");
		};
		let entry = self.function_entry(ctor)?;
		let forward = entry.forward.ok_or(JitError::NotFound)?;

		let exception_obj = self.new_reg(Some(ty));
		self.emit_new(exception_obj, ty, int(ty.managed_size.get() as i64), il_offset)?;

		self.append(
			MirInsnCode::Call,
			vec![item(entry.proto), item(forward), reg(self.exception_reg), reg(exception_obj)],
		);

		let no_exception = self.new_label();
		self.append(MirInsnCode::Bf, vec![lbl(no_exception), reg(self.exception_reg)]);
		self.throw(il_offset, None)?;
		self.append_label(no_exception);

		self.append(MirInsnCode::Mov, vec![reg(self.exception_reg), reg(exception_obj)]);
		self.throw(il_offset, Some(ty))
	}

	/// Allocates an object via `gc_new`, routing a null result into an
	/// `OutOfMemoryException` throw. Arrays resolve their runtime type
	/// through the `get_array_type` helper.
	pub fn emit_new(&mut self, result: MirReg, ty: &'l Type<'l>, size: MirOp, il_offset: u32) -> Result<()> {
		let type_ref_op = if ty.is_array.get() {
			let element = ty.element_type.get().ok_or(JitError::NotFound)?;
			let element_item = self.type_item(element)?;
			let (proto, func) = self.runtime.get_array_type;
			self.append(MirInsnCode::Call, vec![item(proto), item(func), reg(result), item(element_item)]);
			reg(result)
		} else {
			item(self.type_item(ty)?)
		};

		let (proto, func) = self.runtime.gc_new;
		self.append(MirInsnCode::Call, vec![item(proto), item(func), reg(result), type_ref_op, size]);

		// allocating the OOM exception itself must not recurse
		if ty != self.registry.well_known().out_of_memory_exception {
			let not_null = self.new_label();
			self.append(MirInsnCode::Bt, vec![lbl(not_null), reg(result)]);
			let oom = self.registry.well_known().out_of_memory_exception;
			self.throw_new(il_offset, oom)?;
			self.append_label(not_null);
		}
		Ok(())
	}

	/// Branches over a `NullReferenceException` throw when `reg` holds a
	/// non-null reference. Interface slots test their instance word.
	pub fn null_check(&mut self, il_offset: u32, checked: MirReg, ty: Option<&'l Type<'l>>) -> Result<()> {
		let wk = self.registry.well_known();
		let Some(ty) = ty else {
			// a statically null receiver always throws
			return self.throw_new(il_offset, wk.null_reference_exception);
		};
		check!(ty.is_object_ref());

		let mut checked = checked;
		if ty.is_interface() {
			let temp = self.new_reg(Some(wk.object));
			self.append(MirInsnCode::Mov, vec![reg(temp), MirOp::mem(MirType::P, 8, checked)]);
			checked = temp;
		}

		let not_null = self.new_label();
		self.append(MirInsnCode::Bt, vec![lbl(not_null), reg(checked)]);
		self.throw_new(il_offset, wk.null_reference_exception)?;
		self.append_label(not_null);
		Ok(())
	}

	/// Unsigned `index < Length` bounds check; negative indices wrap above
	/// any possible length and take the throw in the same branch.
	pub fn oob_check(&mut self, il_offset: u32, array_reg: MirReg, index_reg: MirReg) -> Result<()> {
		let not_oob = self.new_label();
		self.append(
			MirInsnCode::UBlt,
			vec![
				lbl(not_oob),
				reg(index_reg),
				MirOp::mem(MirType::I32, self.array_length_offset(), array_reg),
			],
		);
		let oob = self.registry.well_known().index_out_of_range_exception;
		self.throw_new(il_offset, oob)?;
		self.append_label(not_oob);
		Ok(())
	}
}
