use crate::errors::Result;
use crate::mir::{MirLabel, MirReg};
use crate::model::Type;
use crate::utilities::{check, check_fail};

use super::context::JitContext;

/// One slot of the abstract operand stack: the tracked type (`None` for the
/// null reference) and the register backing the value.
#[derive(Debug, Copy, Clone)]
pub(crate) struct StackSlot<'l> {
	pub ty: Option<&'l Type<'l>>,
	pub reg: MirReg,
}

/// The recorded stack shape and join label at an IL offset. Created the
/// first time scanning or a forward branch reaches the offset.
#[derive(Debug, Clone)]
pub(crate) struct StackSnapshot<'l> {
	pub stack: Vec<StackSlot<'l>>,
	pub label: MirLabel,
}

impl<'l> JitContext<'l> {
	pub fn stack_pop(&mut self) -> Result<StackSlot<'l>> {
		match self.stack.pop() {
			Some(slot) => Ok(slot),
			None => check_fail!("operand stack underflow"),
		}
	}

	/// Pushes a slot of the given type, allocating its backing register.
	/// The stack may never grow beyond the method's declared maximum.
	pub fn stack_push(&mut self, ty: Option<&'l Type<'l>>) -> Result<MirReg> {
		let max_stack = self.body.as_ref().map(|body| body.max_stack).unwrap_or(0);
		check!(self.stack.len() < max_stack as usize);

		let reg = self.new_reg(ty);
		self.stack.push(StackSlot { ty, reg });
		Ok(reg)
	}

	pub fn stack_snapshot(&self) -> Vec<StackSlot<'l>> {
		self.stack.clone()
	}

	/// Replaces the live stack with the snapshot recorded at `il_offset`.
	pub fn stack_copy_from(&mut self, il_offset: u32) {
		if let Some(snapshot) = self.snapshots.get(&il_offset) {
			self.stack = snapshot.stack.clone();
		}
	}

	/// Merges the live stack into the snapshot at `il_offset`. On forward
	/// edges (`allow_change`) slot types may widen towards a common
	/// supertype; on backward edges the stacks must already agree.
	pub fn stack_merge(&mut self, il_offset: u32, allow_change: bool) -> Result<()> {
		let registry = self.registry;
		let len = self.stack.len();

		let Some(snapshot) = self.snapshots.get_mut(&il_offset) else {
			check_fail!("no stack snapshot at IL_{il_offset:04X}");
		};
		check!(snapshot.stack.len() == len);

		for i in 0..len {
			let t = self.stack[i].ty;
			let s = snapshot.stack[i].ty;

			let u = if registry.is_verifier_assignable_to(t, s) {
				s
			} else if registry.is_verifier_assignable_to(s, t) {
				t
			} else {
				// the closest common supertype beyond these two rules is
				// deliberately not computed
				check_fail!("incompatible stack slots at IL_{il_offset:04X}");
			};

			match allow_change {
				true => snapshot.stack[i].ty = u,
				false => check!(snapshot.stack[i].ty == u),
			}
		}

		Ok(())
	}
}
