use std::io::{Cursor, Error, ErrorKind};

/// Early-exit verification check. Logs the failing expression and returns
/// [`JitError::CheckFailed`](crate::errors::JitError) from the enclosing function.
macro_rules! check {
	($cond: expr) => {
		if !($cond) {
			tracing::error!("check `{}` failed at {}:{}", stringify!($cond), file!(), line!());
			return Err($crate::errors::JitError::CheckFailed);
		}
	};
	($cond: expr, $err: expr) => {
		if !($cond) {
			tracing::error!("check `{}` failed at {}:{}", stringify!($cond), file!(), line!());
			return Err($err);
		}
	};
}

/// Unconditional rejection, for opcodes and shapes that are invalid CIL or
/// deliberately unsupported.
macro_rules! check_fail {
	() => {{
		tracing::error!("check failed at {}:{}", file!(), line!());
		return Err($crate::errors::JitError::CheckFailed);
	}};
	($($fmt: tt)*) => {{
		tracing::error!("check failed at {}:{}: {}", file!(), line!(), format_args!($($fmt)*));
		return Err($crate::errors::JitError::CheckFailed);
	}};
}

pub(crate) use check;
pub(crate) use check_fail;

#[inline]
pub(crate) fn read_bytes_slice_from_stream<'l>(stream: &mut Cursor<&'l [u8]>, count: usize) -> std::io::Result<&'l [u8]> {
	let start = stream.position() as usize;
	let range = start..start + count;
	if range.end > stream.get_ref().len() {
		return Err(Error::from(ErrorKind::UnexpectedEof));
	}
	stream.set_position(range.end as u64);
	Ok(&stream.get_ref()[range])
}

pub(crate) trait FromByteStream where Self: Sized {
	fn read(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self>;
}

macro_rules! impl_from_le_byte_stream {
    ($($ty: ty),*) => {$(
		impl crate::utilities::FromByteStream for $ty {
			#[inline]
			fn read(stream: &mut std::io::Cursor<&[u8]>) -> std::io::Result<Self> {
				let start = stream.position() as usize;
				let end = start + std::mem::size_of::<Self>();
				let Some(bytes) = stream.get_ref().get(start..end) else {
					return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
				};
				stream.set_position(end as u64);
				Ok(Self::from_le_bytes(bytes.try_into().unwrap()))
			}
		}
	)*};
}

impl_from_le_byte_stream!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);
