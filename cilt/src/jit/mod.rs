//! The CIL→MIR translator: symbol emission, per-method translation, and the
//! module finaliser that publishes the result into the shared code context.

pub(crate) mod context;
mod except;
mod method;
pub(crate) mod stack;

use crate::errors::{JitError, Result};
use crate::mir::{CodeContext, FuncAddr, MirItemId, MirLabel, MirOp, MirReg};
use crate::model::{Assembly, ImportedMember, MethodCodeType, StackType};
use crate::registry::TypeRegistry;
use crate::utilities::{check, check_fail};

use context::{JitContext, StaticFieldEntry};

#[inline]
fn reg(reg: MirReg) -> MirOp {
	MirOp::Reg(reg)
}

#[inline]
fn int(value: i64) -> MirOp {
	MirOp::Int(value)
}

#[inline]
fn lbl(label: MirLabel) -> MirOp {
	MirOp::Label(label)
}

#[inline]
fn item(item: MirItemId) -> MirOp {
	MirOp::Ref(item)
}

/// The runtime services the module finaliser calls back into. `gc_new` and
/// friends are reached from emitted code through their linked symbols; these
/// two are the only entries the compiler itself needs at finalise time.
pub trait JitRuntime {
	/// Registers the address of a static field (or of a managed slot inside
	/// one) as a GC root.
	fn add_static_root(&mut self, address: u64);

	/// Materialises the runtime string object for a user string and returns
	/// its address; the `string$N` symbol is bound to it.
	fn intern_string(&mut self, token: u32, chars: &str) -> u64;
}

/// Assemblies whose methods may be marked internal-call.
const INTERNAL_CALL_ASSEMBLIES: [&str; 1] = [crate::registry::CORELIB_NAME];

/// Compiles a fully-loaded assembly into `code_context`. On success every
/// non-abstract method carries its emitted function and linked address, all
/// vtables are patched, and the static-field region is rooted. On failure
/// the half-built module is dropped before publication, so no partial code
/// is ever reachable.
///
/// The embedder must have loaded the runtime helper symbols (and, when the
/// corelib was compiled elsewhere, its exported methods) into the context
/// beforehand.
#[tracing::instrument(skip_all, fields(assembly = assembly.name))]
pub fn compile_assembly<'l>(
	registry: &'l TypeRegistry<'l>,
	assembly: &'l Assembly<'l>,
	code_context: &CodeContext,
	runtime: &mut dyn JitRuntime,
) -> Result<()> {
	let wk = registry.well_known();
	let mut ctx = JitContext::new(registry, assembly);

	// declare every type the method bodies can reach
	for &ty in &assembly.defined_types {
		ctx.import_type(ty, false)?;
	}
	for &ty in &assembly.imported_types {
		ctx.import_type(ty, false)?;
	}

	// the exceptions the runtime may throw, unless this is the corelib and
	// they are defined right here
	if assembly.name != wk.exception.assembly_name {
		for ty in wk.runtime_exceptions() {
			ctx.import_type(ty, true)?;
		}
	}

	// user strings become linker symbols
	for &key in assembly.user_strings.keys() {
		let string_item = ctx.module.new_import(format!("string${key}"));
		ctx.strings.insert(key, string_item);
	}

	// static-field storage: bss for our own fields, imports for foreign ones
	for &field in &assembly.defined_fields {
		if !field.is_static() {
			continue;
		}
		let name = field.to_string();
		let field_item = ctx.module.new_bss(&name, field.field_type.get().stack_size.get());
		ctx.module.new_export(&name);
		ctx.static_fields.insert(field, StaticFieldEntry { item: field_item, is_bss: true });
	}

	for &method in &assembly.defined_methods {
		ctx.prepare_method_signature(method, false)?;
	}
	for &member in &assembly.imported_members {
		match member {
			ImportedMember::Method(method) => ctx.prepare_method_signature(method, true)?,
			ImportedMember::Field(field) if field.is_static() => {
				let field_item = ctx.module.new_import(field.to_string());
				ctx.static_fields.insert(field, StaticFieldEntry { item: field_item, is_bss: false });
			}
			ImportedMember::Field(_) => {}
		}
	}

	// translate every defined method
	for ty in &assembly.defined_types {
		let methods = ty.methods.borrow().clone();
		for method in methods {
			if method.is_abstract() {
				continue;
			}
			check!(!method.is_unmanaged());

			match method.code_type() {
				MethodCodeType::Il if method.is_internal_call() => {
					check!(method.body.borrow().is_none());
					check!(INTERNAL_CALL_ASSEMBLIES.contains(&assembly.name));
				}
				MethodCodeType::Il => ctx.compile_method(method)?,
				MethodCodeType::Runtime => check_fail!("runtime methods are not supported"),
				MethodCodeType::Native => check_fail!(),
			}
		}
	}

	finalise(assembly, ctx, code_context, runtime)
}

/// Publishes the finished module: rebinds defined types and user strings as
/// external symbols, links lazily under the context mutex, patches vtables
/// with the resolved addresses and registers the static GC roots.
fn finalise<'l>(
	assembly: &'l Assembly<'l>,
	ctx: JitContext<'l>,
	code_context: &CodeContext,
	runtime: &mut dyn JitRuntime,
) -> Result<()> {
	let JitContext { module, static_fields, .. } = ctx;

	for ty in &assembly.defined_types {
		code_context.load_external(ty.to_string(), ty.id() as u64);
	}
	for (&key, &chars) in &assembly.user_strings {
		let address = runtime.intern_string(key, chars);
		code_context.load_external(format!("string${key}"), address);
	}

	code_context.publish(module)?;

	// every emitted method now has a generated (lazily, on first call)
	// address behind its symbol
	for method in &assembly.defined_methods {
		if method.mir_func().is_none() {
			continue;
		}
		let address = code_context.resolve(&method.to_string()).ok_or(JitError::NotFound)?;
		method.func_addr.set(Some(FuncAddr(address)));
	}

	// patch the virtual method tables of every instantiable type
	for ty in &assembly.defined_types {
		if ty.is_abstract() || ty.is_interface() {
			continue;
		}
		let virtual_methods = ty.virtual_methods.borrow();
		if virtual_methods.is_empty() {
			continue;
		}

		let mut vtable = ty.vtable.borrow_mut();
		if vtable.len() < virtual_methods.len() {
			vtable.resize(virtual_methods.len(), None);
		}
		for (slot, method) in virtual_methods.iter().enumerate() {
			let address = method.func_addr().ok_or(JitError::NotFound)?;
			vtable[slot] = Some(address);
		}
	}

	// static references and the managed slots of static value types are
	// GC roots
	for (field, entry) in &static_fields {
		if !entry.is_bss {
			continue;
		}
		let address = code_context.resolve(&field.to_string()).ok_or(JitError::NotFound)?;
		let field_type = field.field_type.get();
		match field_type.stack_type.get() {
			StackType::O => runtime.add_static_root(address),
			StackType::ValueType => {
				for &offset in field_type.managed_pointers_offsets.borrow().iter() {
					runtime.add_static_root(address + offset as u64);
				}
			}
			_ => {}
		}
	}

	Ok(())
}
