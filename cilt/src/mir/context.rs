use std::sync::Mutex;

use fxhash::{FxHashMap, FxHashSet};

use crate::errors::{JitError, Result};
use crate::mir::{MirFunc, MirItem, MirItemId, MirModule};

/// The linked address of a generated function. With the lazy gen policy the
/// address is handed out at link time; the machine code behind it is only
/// materialised on the first call.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct FuncAddr(pub u64);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ModuleId(pub u32);

const CODE_BASE: u64 = 0x4000_0000;
const CODE_STRIDE: u64 = 0x100;
const DATA_BASE: u64 = 0x2000_0000;

/// The process-wide code context. Finished modules migrate in here under the
/// context mutex; linking resolves every import against the symbols the
/// embedder loaded and the exports of previously published modules. Emitted
/// code never touches the mutex.
#[derive(Debug, Default)]
pub struct CodeContext {
	inner: Mutex<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
	modules: Vec<LoadedModule>,
	symbols: FxHashMap<String, u64>,
	functions: FxHashMap<u64, (ModuleId, MirItemId)>,
	generated: FxHashSet<u64>,
	next_code: u64,
	next_data: u64,
}

impl Default for ContextInner {
	fn default() -> Self {
		Self {
			modules: vec![],
			symbols: Default::default(),
			functions: Default::default(),
			generated: Default::default(),
			next_code: CODE_BASE,
			next_data: DATA_BASE,
		}
	}
}

#[derive(Debug)]
struct LoadedModule {
	module: MirModule,
	/// The linked value of every item: imports resolve to external symbols,
	/// functions and bss to their assigned addresses, prototypes to zero.
	item_values: Vec<u64>,
}

/// A published module plus its linked item values, as consumed by an
/// executing backend.
#[derive(Debug, Clone)]
pub struct LinkedModule {
	pub module: MirModule,
	pub item_values: Vec<u64>,
}

impl CodeContext {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers an embedder symbol (runtime helper, type handle, user
	/// string, previously generated code) for import resolution.
	pub fn load_external(&self, name: impl Into<String>, value: u64) {
		let mut inner = self.inner.lock().unwrap();
		inner.symbols.insert(name.into(), value);
	}

	/// Migrates a finished module into the context and links it: every
	/// function and bss block is assigned a stable address, then every
	/// import is resolved. Unresolvable imports fail with
	/// [`JitError::NotFound`] and the module is discarded.
	pub fn publish(&self, module: MirModule) -> Result<ModuleId> {
		let mut inner = self.inner.lock().unwrap();
		let module_id = ModuleId(inner.modules.len() as u32);

		// address assignment pass
		let mut function_addrs = vec![];
		for (index, item) in module.items.iter().enumerate() {
			match item {
				MirItem::Func(func) => {
					let addr = inner.next_code;
					inner.next_code += CODE_STRIDE;
					inner.symbols.insert(func.name.clone(), addr);
					function_addrs.push((index, addr));
				}
				MirItem::Bss { name, size } => {
					let addr = inner.next_data;
					inner.next_data += (*size as u64 + 7) & !7;
					inner.symbols.insert(name.clone(), addr);
				}
				_ => {}
			}
		}

		// import resolution pass
		let mut item_values = Vec::with_capacity(module.items.len());
		for item in &module.items {
			let value = match item {
				MirItem::Proto { .. } => 0,
				MirItem::Import { name } | MirItem::Export { name } | MirItem::Forward { name } => {
					match inner.symbols.get(name) {
						Some(value) => *value,
						None => {
							tracing::error!(symbol = name.as_str(), "unresolved symbol during link");
							return Err(JitError::NotFound);
						}
					}
				}
				MirItem::Bss { name, .. } | MirItem::Func(MirFunc { name, .. }) => inner.symbols[name.as_str()],
			};
			item_values.push(value);
		}

		for (index, addr) in function_addrs {
			inner.functions.insert(addr, (module_id, MirItemId(index as u32)));
		}
		inner.modules.push(LoadedModule { module, item_values });
		Ok(module_id)
	}

	pub fn resolve(&self, name: &str) -> Option<u64> {
		self.inner.lock().unwrap().symbols.get(name).copied()
	}

	pub fn symbol_names(&self) -> Vec<String> {
		let mut names: Vec<_> = self.inner.lock().unwrap().symbols.keys().cloned().collect();
		names.sort();
		names
	}

	/// Locates the function behind a linked address and marks it generated;
	/// generation happens on the first call per function.
	pub fn function_at(&self, addr: FuncAddr) -> Option<(ModuleId, MirItemId)> {
		let mut inner = self.inner.lock().unwrap();
		let location = inner.functions.get(&addr.0).copied()?;
		inner.generated.insert(addr.0);
		Some(location)
	}

	pub fn is_generated(&self, addr: FuncAddr) -> bool {
		self.inner.lock().unwrap().generated.contains(&addr.0)
	}

	/// Snapshots a published module together with its linked item values.
	pub fn linked_module(&self, id: ModuleId) -> LinkedModule {
		let inner = self.inner.lock().unwrap();
		let loaded = &inner.modules[id.0 as usize];
		LinkedModule { module: loaded.module.clone(), item_values: loaded.item_values.clone() }
	}

	pub fn with_module<R>(&self, id: ModuleId, f: impl FnOnce(&MirModule) -> R) -> R {
		let inner = self.inner.lock().unwrap();
		f(&inner.modules[id.0 as usize].module)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mir::MirType;

	#[test]
	fn publish_links_imports_against_loaded_externals() {
		let context = CodeContext::new();
		context.load_external("gc_new", 0x1234);

		let mut module = MirModule::new("m");
		let import = module.new_import("gc_new");
		let func = module.new_func("f", vec![MirType::P], vec![]);
		let id = context.publish(module).unwrap();

		let linked = context.linked_module(id);
		assert_eq!(linked.item_values[import.0 as usize], 0x1234);
		let addr = linked.item_values[func.0 as usize];
		assert_eq!(context.resolve("f"), Some(addr));
	}

	#[test]
	fn unresolved_import_fails_the_link() {
		let context = CodeContext::new();
		let mut module = MirModule::new("m");
		module.new_import("missing");
		assert_eq!(context.publish(module), Err(JitError::NotFound));
	}

	#[test]
	fn generation_is_lazy_per_function() {
		let context = CodeContext::new();
		let mut module = MirModule::new("m");
		module.new_func("f", vec![MirType::P], vec![]);
		context.publish(module).unwrap();

		let addr = FuncAddr(context.resolve("f").unwrap());
		assert!(!context.is_generated(addr));
		context.function_at(addr).unwrap();
		assert!(context.is_generated(addr));
	}
}
