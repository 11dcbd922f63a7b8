//! CIL bytecode decoding: the opcode table, inline operand reads, and the
//! iterator the translator drives over a method body.

use std::fmt::{Debug, Formatter};
use std::io::{Cursor, Error, ErrorKind, Result};

use crate::metadata_token::MetadataToken;
use crate::utilities::{read_bytes_slice_from_stream, FromByteStream};

/// How an opcode hands control to its successor. Drives the dead-stack rule
/// at instruction boundaries and the end-of-method check.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ControlFlow {
	Next,
	Break,
	Call,
	Branch,
	CondBranch,
	Return,
	Throw,
	Meta,
}

trait ReadOperand<'l> where Self: Sized {
	fn read(stream: &mut Cursor<&'l [u8]>) -> Result<Self>;
}

macro_rules! impl_read_operand {
    ($($ty: ty),*) => {$(
		impl<'l> ReadOperand<'l> for $ty {
			#[inline]
			fn read(stream: &mut Cursor<&'l [u8]>) -> Result<Self> {
				<$ty as FromByteStream>::read(stream)
			}
		}
	)*};
}

impl_read_operand!(u8, i8, u16, i32, i64, f32, f64);

impl<'l> ReadOperand<'l> for MetadataToken {
	fn read(stream: &mut Cursor<&'l [u8]>) -> Result<Self> {
		let value = u32::read(stream)?;
		MetadataToken::try_from(value).map_err(|_| Error::from(ErrorKind::InvalidData))
	}
}

macro_rules! debug_opcode {
	($name: ident, $f: expr, $self: expr, $ident: ident) => {
		if $name::$ident == *$self {
			return write!($f, "OpCode::{}", stringify!($ident));
		}
	};
	($name: ident, $f: expr, $self: expr, $ident: ident ($ty: ty)) => {
		if let $name::$ident(v) = $self {
			return write!($f, "OpCode::{}({:X?})", stringify!($ident), v);
		}
	};
}

macro_rules! define_opcodes {
    (
		enum $name: ident $(<$lifetime: lifetime>)? {
			$(
				$(#[$attr: meta])*
				$ident: ident $(($ty: ty))? = $discriminant: literal $(=> $flow: ident)?
			),*
		}
	) => {
		#[allow(non_camel_case_types)]
		#[derive(Copy, Clone, PartialEq)]
		pub enum $name $(<$lifetime>)? {
			$(
				$(#[$attr])*
				$ident $(($ty))?
			),*
		}

		impl $(<$lifetime>)? $name $(<$lifetime>)? {
			pub fn read(stream: &mut Cursor<& $($lifetime)? [u8]>) -> Result<Self> {
				let discriminant = <u8 as FromByteStream>::read(stream)?;
				match discriminant {
					$($discriminant => Ok($name::$ident $((<$ty as ReadOperand>::read(stream)?))?),)*
					_ => Err(Error::new(ErrorKind::InvalidData, "invalid opcode")),
				}
			}

			pub fn control_flow(&self) -> ControlFlow {
				match self {
					$($name::$ident { .. } => {
						#[allow(unused_variables)]
						let flow = ControlFlow::Next;
						$(let flow = ControlFlow::$flow;)?
						flow
					})*
				}
			}
		}

		impl $(<$lifetime>)? Debug for $name $(<$lifetime>)? {
			fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
				$(debug_opcode! { $name, f, self, $ident $(($ty))? })*
				Ok(())
			}
		}
	};
}

define_opcodes! {
	enum OpCode<'l> {
		nop = 0x00,
		/// Debugger breakpoint.
		dbg_break = 0x01 => Break,
		ldarg_0 = 0x02,
		ldarg_1 = 0x03,
		ldarg_2 = 0x04,
		ldarg_3 = 0x05,
		ldloc_0 = 0x06,
		ldloc_1 = 0x07,
		ldloc_2 = 0x08,
		ldloc_3 = 0x09,
		stloc_0 = 0x0A,
		stloc_1 = 0x0B,
		stloc_2 = 0x0C,
		stloc_3 = 0x0D,
		ldarg_s(u8) = 0x0E,
		ldarga_s(u8) = 0x0F,
		starg_s(u8) = 0x10,
		ldloc_s(u8) = 0x11,
		ldloca_s(u8) = 0x12,
		stloc_s(u8) = 0x13,
		ldnull = 0x14,
		ldc_i4_m1 = 0x15,
		ldc_i4_0 = 0x16,
		ldc_i4_1 = 0x17,
		ldc_i4_2 = 0x18,
		ldc_i4_3 = 0x19,
		ldc_i4_4 = 0x1A,
		ldc_i4_5 = 0x1B,
		ldc_i4_6 = 0x1C,
		ldc_i4_7 = 0x1D,
		ldc_i4_8 = 0x1E,
		ldc_i4_s(i8) = 0x1F,
		ldc_i4(i32) = 0x20,
		ldc_i8(i64) = 0x21,
		ldc_r4(f32) = 0x22,
		ldc_r8(f64) = 0x23,
		dup = 0x25,
		pop = 0x26,
		/// Exit the current method and jump to the given method.
		jmp(MetadataToken) = 0x27 => Call,
		call(MetadataToken) = 0x28 => Call,
		calli(MetadataToken) = 0x29 => Call,
		ret = 0x2A => Return,
		/// Branch displacements are relative to the next instruction.
		br_s(i8) = 0x2B => Branch,
		brfalse_s(i8) = 0x2C => CondBranch,
		brtrue_s(i8) = 0x2D => CondBranch,
		beq_s(i8) = 0x2E => CondBranch,
		bge_s(i8) = 0x2F => CondBranch,
		bgt_s(i8) = 0x30 => CondBranch,
		ble_s(i8) = 0x31 => CondBranch,
		blt_s(i8) = 0x32 => CondBranch,
		bne_un_s(i8) = 0x33 => CondBranch,
		bge_un_s(i8) = 0x34 => CondBranch,
		bgt_un_s(i8) = 0x35 => CondBranch,
		ble_un_s(i8) = 0x36 => CondBranch,
		blt_un_s(i8) = 0x37 => CondBranch,
		br(i32) = 0x38 => Branch,
		brfalse(i32) = 0x39 => CondBranch,
		brtrue(i32) = 0x3A => CondBranch,
		beq(i32) = 0x3B => CondBranch,
		bge(i32) = 0x3C => CondBranch,
		bgt(i32) = 0x3D => CondBranch,
		ble(i32) = 0x3E => CondBranch,
		blt(i32) = 0x3F => CondBranch,
		bne_un(i32) = 0x40 => CondBranch,
		bge_un(i32) = 0x41 => CondBranch,
		bgt_un(i32) = 0x42 => CondBranch,
		ble_un(i32) = 0x43 => CondBranch,
		blt_un(i32) = 0x44 => CondBranch,
		switch(SwitchTable<'l>) = 0x45 => CondBranch,
		ldind_i1 = 0x46,
		ldind_u1 = 0x47,
		ldind_i2 = 0x48,
		ldind_u2 = 0x49,
		ldind_i4 = 0x4A,
		ldind_u4 = 0x4B,
		ldind_i8 = 0x4C,
		ldind_i = 0x4D,
		ldind_r4 = 0x4E,
		ldind_r8 = 0x4F,
		ldind_ref = 0x50,
		stind_ref = 0x51,
		stind_i1 = 0x52,
		stind_i2 = 0x53,
		stind_i4 = 0x54,
		stind_i8 = 0x55,
		stind_r4 = 0x56,
		stind_r8 = 0x57,
		add = 0x58,
		sub = 0x59,
		mul = 0x5A,
		div = 0x5B,
		div_un = 0x5C,
		rem = 0x5D,
		rem_un = 0x5E,
		and = 0x5F,
		or = 0x60,
		xor = 0x61,
		shl = 0x62,
		shr = 0x63,
		shr_un = 0x64,
		neg = 0x65,
		not = 0x66,
		conv_i1 = 0x67,
		conv_i2 = 0x68,
		conv_i4 = 0x69,
		conv_i8 = 0x6A,
		conv_r4 = 0x6B,
		conv_r8 = 0x6C,
		conv_u4 = 0x6D,
		conv_u8 = 0x6E,
		callvirt(MetadataToken) = 0x6F => Call,
		cpobj(MetadataToken) = 0x70,
		ldobj(MetadataToken) = 0x71,
		ldstr(MetadataToken) = 0x72,
		newobj(MetadataToken) = 0x73 => Call,
		castclass(MetadataToken) = 0x74,
		isinst(MetadataToken) = 0x75,
		conv_r_un = 0x76,
		/// Extract the managed pointer to the payload of a boxed value type.
		unbox(MetadataToken) = 0x79,
		throw = 0x7A => Throw,
		ldfld(MetadataToken) = 0x7B,
		ldflda(MetadataToken) = 0x7C,
		stfld(MetadataToken) = 0x7D,
		ldsfld(MetadataToken) = 0x7E,
		ldsflda(MetadataToken) = 0x7F,
		stsfld(MetadataToken) = 0x80,
		stobj(MetadataToken) = 0x81,
		conv_ovf_i1_un = 0x82,
		conv_ovf_i2_un = 0x83,
		conv_ovf_i4_un = 0x84,
		conv_ovf_i8_un = 0x85,
		conv_ovf_u1_un = 0x86,
		conv_ovf_u2_un = 0x87,
		conv_ovf_u4_un = 0x88,
		conv_ovf_u8_un = 0x89,
		conv_ovf_i_un = 0x8A,
		conv_ovf_u_un = 0x8B,
		box_val(MetadataToken) = 0x8C,
		newarr(MetadataToken) = 0x8D,
		ldlen = 0x8E,
		ldelema(MetadataToken) = 0x8F,
		ldelem_i1 = 0x90,
		ldelem_u1 = 0x91,
		ldelem_i2 = 0x92,
		ldelem_u2 = 0x93,
		ldelem_i4 = 0x94,
		ldelem_u4 = 0x95,
		ldelem_i8 = 0x96,
		ldelem_i = 0x97,
		ldelem_r4 = 0x98,
		ldelem_r8 = 0x99,
		ldelem_ref = 0x9A,
		stelem_i = 0x9B,
		stelem_i1 = 0x9C,
		stelem_i2 = 0x9D,
		stelem_i4 = 0x9E,
		stelem_i8 = 0x9F,
		stelem_r4 = 0xA0,
		stelem_r8 = 0xA1,
		stelem_ref = 0xA2,
		ldelem(MetadataToken) = 0xA3,
		stelem(MetadataToken) = 0xA4,
		unbox_any(MetadataToken) = 0xA5,
		conv_ovf_i1 = 0xB3,
		conv_ovf_u1 = 0xB4,
		conv_ovf_i2 = 0xB5,
		conv_ovf_u2 = 0xB6,
		conv_ovf_i4 = 0xB7,
		conv_ovf_u4 = 0xB8,
		conv_ovf_i8 = 0xB9,
		conv_ovf_u8 = 0xBA,
		refanyval(MetadataToken) = 0xC2,
		ckfinite = 0xC3,
		mkrefany(MetadataToken) = 0xC6,
		ldtoken(MetadataToken) = 0xD0,
		conv_u2 = 0xD1,
		conv_u1 = 0xD2,
		conv_i = 0xD3,
		conv_ovf_i = 0xD4,
		conv_ovf_u = 0xD5,
		add_ovf = 0xD6,
		add_ovf_un = 0xD7,
		mul_ovf = 0xD8,
		mul_ovf_un = 0xD9,
		sub_ovf = 0xDA,
		sub_ovf_un = 0xDB,
		endfinally = 0xDC => Return,
		leave(i32) = 0xDD => Branch,
		leave_s(i8) = 0xDE => Branch,
		stind_i = 0xDF,
		conv_u = 0xE0,
		compound(CompoundOpCode) = 0xFE => Meta
	}
}

define_opcodes! {
	enum CompoundOpCode {
		arglist = 0x00,
		ceq = 0x01,
		cgt = 0x02,
		cgt_un = 0x03,
		clt = 0x04,
		clt_un = 0x05,
		ldftn(MetadataToken) = 0x06,
		ldvirtftn(MetadataToken) = 0x07,
		ldarg(u16) = 0x09,
		ldarga(u16) = 0x0A,
		starg(u16) = 0x0B,
		ldloc(u16) = 0x0C,
		ldloca(u16) = 0x0D,
		stloc(u16) = 0x0E,
		localloc = 0x0F,
		endfilter = 0x11 => Return,
		unaligned(u8) = 0x12 => Meta,
		volatile = 0x13 => Meta,
		tail = 0x14 => Meta,
		initobj(MetadataToken) = 0x15,
		constrained(MetadataToken) = 0x16 => Meta,
		cpblk = 0x17,
		initblk = 0x18,
		no_chk(u8) = 0x19 => Meta,
		rethrow = 0x1A => Throw,
		sizeof(MetadataToken) = 0x1C,
		refanytype = 0x1D,
		readonly = 0x1E => Meta
	}
}

impl<'l> ReadOperand<'l> for CompoundOpCode {
	#[inline]
	fn read(stream: &mut Cursor<&'l [u8]>) -> Result<Self> {
		CompoundOpCode::read(stream)
	}
}

impl<'l> OpCode<'l> {
	/// The effective control flow, looking through the compound page.
	pub fn effective_control_flow(&self) -> ControlFlow {
		match self {
			OpCode::compound(inner) => inner.control_flow(),
			other => other.control_flow(),
		}
	}
}

#[derive(Copy, Clone, PartialEq)]
pub struct SwitchTable<'l>(&'l [u8]);

impl<'l> ReadOperand<'l> for SwitchTable<'l> {
	fn read(stream: &mut Cursor<&'l [u8]>) -> Result<Self> {
		let len = u32::read(stream)?;
		let data = read_bytes_slice_from_stream(stream, len as usize * 4)?;
		Ok(Self(data))
	}
}

impl<'l> SwitchTable<'l> {
	#[inline]
	pub fn len(&self) -> usize {
		self.0.len() / 4
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Displacements relative to the instruction following the whole table.
	#[inline]
	pub fn targets(&self) -> impl Iterator<Item = i32> + '_ {
		(0..self.len()).map(move |i| {
			let slice = &self.0[i * 4..(i + 1) * 4];
			i32::from_le_bytes(slice.try_into().unwrap())
		})
	}
}

impl Debug for SwitchTable<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_list();
		for target in self.targets() {
			dbg.entry(&target);
		}
		dbg.finish()
	}
}

pub struct OpCodeIterator<'l> {
	cursor: Cursor<&'l [u8]>,
}

impl<'l> OpCodeIterator<'l> {
	pub fn new(bytes: &'l [u8]) -> Self {
		Self { cursor: Cursor::new(bytes) }
	}

	/// The offset of the next undecoded instruction; right after a `next`
	/// call this is where branch displacements are relative to.
	#[inline]
	pub fn position(&self) -> u32 {
		self.cursor.position() as u32
	}
}

impl<'l> Iterator for OpCodeIterator<'l> {
	type Item = (u32, Result<OpCode<'l>>);
	fn next(&mut self) -> Option<Self::Item> {
		let position = self.cursor.position();
		match position == self.cursor.get_ref().len() as u64 {
			true => None,
			false => Some((position as u32, OpCode::read(&mut self.cursor))),
		}
	}
}
