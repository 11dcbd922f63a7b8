//! The in-memory form of the MIR-style backend the translator targets:
//! modules of prototypes, imports, exports, forwards, bss blocks and
//! functions, plus the instruction set the lowering emits. Machine-code
//! generation itself lives behind [`CodeContext`]'s lazy link interface.

mod context;

pub use context::*;

/// Backend value types. `Blk` is a by-address block of the given byte size,
/// used for value-type and interface-slot parameters.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MirType {
	I8,
	U8,
	I16,
	U16,
	I32,
	U32,
	I64,
	U64,
	F,
	D,
	P,
	Blk(u32),
}

impl MirType {
	#[inline]
	pub fn is_blk(&self) -> bool {
		matches!(self, MirType::Blk(_))
	}

	/// Size in bytes of a memory access of this type.
	pub fn size(&self) -> u32 {
		match self {
			MirType::I8 | MirType::U8 => 1,
			MirType::I16 | MirType::U16 => 2,
			MirType::I32 | MirType::U32 | MirType::F => 4,
			MirType::I64 | MirType::U64 | MirType::D | MirType::P => 8,
			MirType::Blk(size) => *size,
		}
	}
}

/// A function register. Register 0 is reserved as "none".
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct MirReg(pub u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct MirLabel(pub u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct MirItemId(pub u32);

/// The instruction codes the translator emits. Integer codes operate on the
/// full 64-bit register unless narrowed through [`MirInsnCode::int32`];
/// float/double forms are reached through [`MirInsnCode::single`] and
/// [`MirInsnCode::double`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum MirInsnCode {
	Mov,
	FMov,
	DMov,
	Ext8,
	UExt8,
	Ext16,
	UExt16,
	Ext32,
	UExt32,
	I2F,
	I2D,
	F2I,
	D2I,
	F2D,
	D2F,
	Neg,
	NegS,
	FNeg,
	DNeg,
	Add,
	AddS,
	FAdd,
	DAdd,
	Sub,
	SubS,
	FSub,
	DSub,
	Mul,
	MulS,
	FMul,
	DMul,
	Div,
	DivS,
	FDiv,
	DDiv,
	UDiv,
	UDivS,
	Mod,
	ModS,
	UMod,
	UModS,
	And,
	AndS,
	Or,
	OrS,
	Xor,
	XorS,
	Eq,
	EqS,
	FEq,
	DEq,
	Ne,
	NeS,
	FNe,
	DNe,
	Lt,
	LtS,
	FLt,
	DLt,
	ULt,
	ULtS,
	Le,
	LeS,
	FLe,
	DLe,
	ULe,
	ULeS,
	Gt,
	GtS,
	FGt,
	DGt,
	UGt,
	UGtS,
	Ge,
	GeS,
	FGe,
	DGe,
	UGe,
	UGeS,
	Jmp,
	Bt,
	BtS,
	Bf,
	BfS,
	Beq,
	BeqS,
	FBeq,
	DBeq,
	Bne,
	BneS,
	FBne,
	DBne,
	Blt,
	BltS,
	FBlt,
	DBlt,
	UBlt,
	UBltS,
	Ble,
	BleS,
	FBle,
	DBle,
	UBle,
	UBleS,
	Bgt,
	BgtS,
	FBgt,
	DBgt,
	UBgt,
	UBgtS,
	Bge,
	BgeS,
	FBge,
	DBge,
	UBge,
	UBgeS,
	Switch,
	Call,
	Inline,
	Ret,
	Alloca,
	Label,
}

impl MirInsnCode {
	/// The 32-bit form of an integer code.
	pub fn int32(self) -> Self {
		use MirInsnCode::*;
		match self {
			Neg => NegS,
			Add => AddS,
			Sub => SubS,
			Mul => MulS,
			Div => DivS,
			UDiv => UDivS,
			Mod => ModS,
			UMod => UModS,
			And => AndS,
			Or => OrS,
			Xor => XorS,
			Eq => EqS,
			Ne => NeS,
			Lt => LtS,
			ULt => ULtS,
			Le => LeS,
			ULe => ULeS,
			Gt => GtS,
			UGt => UGtS,
			Ge => GeS,
			UGe => UGeS,
			Bt => BtS,
			Bf => BfS,
			Beq => BeqS,
			Bne => BneS,
			Blt => BltS,
			UBlt => UBltS,
			Ble => BleS,
			UBle => UBleS,
			Bgt => BgtS,
			UBgt => UBgtS,
			Bge => BgeS,
			UBge => UBgeS,
			other => other,
		}
	}

	/// The single-precision form of a code; unsigned comparisons collapse to
	/// the ordered float form.
	pub fn single(self) -> Self {
		use MirInsnCode::*;
		match self {
			Neg => FNeg,
			Add => FAdd,
			Sub => FSub,
			Mul => FMul,
			Div => FDiv,
			Eq => FEq,
			Ne => FNe,
			Lt | ULt => FLt,
			Le | ULe => FLe,
			Gt | UGt => FGt,
			Ge | UGe => FGe,
			Beq => FBeq,
			Bne => FBne,
			Blt | UBlt => FBlt,
			Ble | UBle => FBle,
			Bgt | UBgt => FBgt,
			Bge | UBge => FBge,
			other => other,
		}
	}

	/// The double-precision form of a code.
	pub fn double(self) -> Self {
		use MirInsnCode::*;
		match self {
			Neg => DNeg,
			Add => DAdd,
			Sub => DSub,
			Mul => DMul,
			Div => DDiv,
			Eq => DEq,
			Ne => DNe,
			Lt | ULt => DLt,
			Le | ULe => DLe,
			Gt | UGt => DGt,
			Ge | UGe => DGe,
			Beq => DBeq,
			Bne => DBne,
			Blt | UBlt => DBlt,
			Ble | UBle => DBle,
			Bgt | UBgt => DBgt,
			Bge | UBge => DBge,
			other => other,
		}
	}
}

/// A memory operand: `[base + index * scale + disp]`, accessed as `ty`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MirMemOp {
	pub ty: MirType,
	pub disp: i64,
	pub base: MirReg,
	pub index: Option<MirReg>,
	pub scale: u32,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum MirOp {
	Reg(MirReg),
	Int(i64),
	Float(f32),
	Double(f64),
	Ref(MirItemId),
	Label(MirLabel),
	Mem(MirMemOp),
}

impl MirOp {
	pub fn mem(ty: MirType, disp: i64, base: MirReg) -> Self {
		MirOp::Mem(MirMemOp { ty, disp, base, index: None, scale: 1 })
	}

	pub fn mem_indexed(ty: MirType, disp: i64, base: MirReg, index: MirReg, scale: u32) -> Self {
		MirOp::Mem(MirMemOp { ty, disp, base, index: Some(index), scale })
	}

	#[inline]
	pub fn as_reg(&self) -> Option<MirReg> {
		match self {
			MirOp::Reg(reg) => Some(*reg),
			_ => None,
		}
	}
}

/// Call instruction operands are laid out as
/// `[proto, callee, results.., args..]`; `Ret` carries the result values;
/// `Switch` carries `[selector, labels..]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MirInsn {
	pub code: MirInsnCode,
	pub ops: Vec<MirOp>,
}

impl MirInsn {
	pub fn new(code: MirInsnCode, ops: Vec<MirOp>) -> Self {
		Self { code, ops }
	}

	pub fn label(label: MirLabel) -> Self {
		Self { code: MirInsnCode::Label, ops: vec![MirOp::Label(label)] }
	}
}

/// A typed function parameter or prototype parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct MirVar {
	pub name: String,
	pub ty: MirType,
}

impl MirVar {
	pub fn new(name: impl Into<String>, ty: MirType) -> Self {
		Self { name: name.into(), ty }
	}
}

#[derive(Debug, Clone)]
struct MirRegInfo {
	name: String,
	ty: MirType,
}

#[derive(Debug, Clone)]
pub struct MirFunc {
	pub name: String,
	pub results: Vec<MirType>,
	pub params: Vec<MirVar>,
	regs: Vec<MirRegInfo>,
	pub insns: Vec<MirInsn>,
	labels: u32,
}

impl MirFunc {
	fn new(name: String, results: Vec<MirType>, params: Vec<MirVar>) -> Self {
		// parameters double as the first registers; block parameters are
		// addresses and live in a pointer-sized register
		let regs = params
			.iter()
			.map(|var| MirRegInfo {
				name: var.name.clone(),
				ty: match var.ty {
					MirType::F => MirType::F,
					MirType::D => MirType::D,
					_ => MirType::I64,
				},
			})
			.collect();
		Self { name, results, params, regs, insns: vec![], labels: 0 }
	}

	pub fn new_reg(&mut self, name: impl Into<String>, ty: MirType) -> MirReg {
		debug_assert!(matches!(ty, MirType::I64 | MirType::F | MirType::D));
		self.regs.push(MirRegInfo { name: name.into(), ty });
		MirReg(self.regs.len() as u32)
	}

	pub fn reg_by_name(&self, name: &str) -> Option<MirReg> {
		let index = self.regs.iter().position(|reg| reg.name == name)?;
		Some(MirReg(index as u32 + 1))
	}

	pub fn reg_ty(&self, reg: MirReg) -> MirType {
		self.regs[reg.0 as usize - 1].ty
	}

	#[inline]
	pub fn reg_count(&self) -> usize {
		self.regs.len()
	}

	pub fn new_label(&mut self) -> MirLabel {
		self.labels += 1;
		MirLabel(self.labels)
	}

	#[inline]
	pub fn append(&mut self, insn: MirInsn) {
		self.insns.push(insn);
	}

	/// Prepended instructions run before everything already emitted; used
	/// for the stack allocations backing value-type registers.
	#[inline]
	pub fn prepend(&mut self, insn: MirInsn) {
		self.insns.insert(0, insn);
	}
}

#[derive(Debug, Clone)]
pub enum MirItem {
	Proto { name: String, results: Vec<MirType>, params: Vec<MirVar> },
	Import { name: String },
	Export { name: String },
	Forward { name: String },
	Bss { name: String, size: u32 },
	Func(MirFunc),
}

impl MirItem {
	pub fn name(&self) -> &str {
		match self {
			MirItem::Proto { name, .. } => name,
			MirItem::Import { name } => name,
			MirItem::Export { name } => name,
			MirItem::Forward { name } => name,
			MirItem::Bss { name, .. } => name,
			MirItem::Func(func) => &func.name,
		}
	}
}

/// A module under construction. Items are only shared with the global
/// [`CodeContext`] once the whole assembly has been emitted and
/// [`CodeContext::publish`] links it.
#[derive(Debug, Clone)]
pub struct MirModule {
	pub name: String,
	pub items: Vec<MirItem>,
}

impl MirModule {
	pub fn new(name: impl Into<String>) -> Self {
		Self { name: name.into(), items: vec![] }
	}

	fn push(&mut self, item: MirItem) -> MirItemId {
		self.items.push(item);
		MirItemId(self.items.len() as u32 - 1)
	}

	pub fn new_proto(&mut self, name: impl Into<String>, results: Vec<MirType>, params: Vec<MirVar>) -> MirItemId {
		self.push(MirItem::Proto { name: name.into(), results, params })
	}

	pub fn new_import(&mut self, name: impl Into<String>) -> MirItemId {
		self.push(MirItem::Import { name: name.into() })
	}

	pub fn new_export(&mut self, name: impl Into<String>) -> MirItemId {
		self.push(MirItem::Export { name: name.into() })
	}

	pub fn new_forward(&mut self, name: impl Into<String>) -> MirItemId {
		self.push(MirItem::Forward { name: name.into() })
	}

	pub fn new_bss(&mut self, name: impl Into<String>, size: u32) -> MirItemId {
		self.push(MirItem::Bss { name: name.into(), size })
	}

	pub fn new_func(&mut self, name: impl Into<String>, results: Vec<MirType>, params: Vec<MirVar>) -> MirItemId {
		self.push(MirItem::Func(MirFunc::new(name.into(), results, params)))
	}

	pub fn item(&self, id: MirItemId) -> &MirItem {
		&self.items[id.0 as usize]
	}

	pub fn func(&self, id: MirItemId) -> &MirFunc {
		match &self.items[id.0 as usize] {
			MirItem::Func(func) => func,
			_ => unreachable!("item is not a function"),
		}
	}

	pub fn func_mut(&mut self, id: MirItemId) -> &mut MirFunc {
		match &mut self.items[id.0 as usize] {
			MirItem::Func(func) => func,
			_ => unreachable!("item is not a function"),
		}
	}

	pub fn find_item(&self, name: &str) -> Option<MirItemId> {
		let index = self.items.iter().position(|item| item.name() == name)?;
		Some(MirItemId(index as u32))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn width_selectors_pick_the_matching_family() {
		assert_eq!(MirInsnCode::Add.int32(), MirInsnCode::AddS);
		assert_eq!(MirInsnCode::Add.single(), MirInsnCode::FAdd);
		assert_eq!(MirInsnCode::Add.double(), MirInsnCode::DAdd);
		assert_eq!(MirInsnCode::UGt.single(), MirInsnCode::FGt);
		assert_eq!(MirInsnCode::Bf.int32(), MirInsnCode::BfS);
		assert_eq!(MirInsnCode::Mov.int32(), MirInsnCode::Mov);
	}

	#[test]
	fn params_are_the_first_registers() {
		let mut module = MirModule::new("m");
		let id = module.new_func(
			"f",
			vec![MirType::P],
			vec![MirVar::new("this", MirType::P), MirVar::new("arg0", MirType::I32)],
		);
		let func = module.func_mut(id);
		let reg = func.new_reg("s1", MirType::I64);
		assert_eq!(func.reg_by_name("this"), Some(MirReg(1)));
		assert_eq!(func.reg_by_name("arg0"), Some(MirReg(2)));
		assert_eq!(reg, MirReg(3));
	}
}
