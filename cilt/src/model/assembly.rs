use fxhash::FxHashMap;

use crate::errors::{JitError, Result};
use crate::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::model::method::Method;
use crate::model::types::{Field, Type};

/// A member imported from another assembly.
#[derive(Debug, Copy, Clone)]
pub enum ImportedMember<'l> {
	Method(&'l Method<'l>),
	Field(&'l Field<'l>),
}

/// A fully-loaded assembly as handed over by the loader: the complete type
/// graph, the methods to compile, and the token tables the method bodies
/// refer to.
#[derive(Debug)]
pub struct Assembly<'l> {
	pub name: &'l str,
	pub major_version: u16,
	pub defined_types: Vec<&'l Type<'l>>,
	pub imported_types: Vec<&'l Type<'l>>,
	pub defined_methods: Vec<&'l Method<'l>>,
	pub defined_fields: Vec<&'l Field<'l>>,
	pub imported_members: Vec<ImportedMember<'l>>,
	/// User strings keyed by their token index.
	pub user_strings: FxHashMap<u32, &'l str>,
}

impl<'l> Assembly<'l> {
	pub fn type_by_token(&self, token: MetadataToken) -> Result<&'l Type<'l>> {
		let table = match token.kind() {
			MetadataTokenKind::TypeDef => &self.defined_types,
			MetadataTokenKind::TypeRef => &self.imported_types,
			_ => return Err(JitError::BadFormat),
		};
		match token.index() {
			0 => Err(JitError::NotFound),
			index => table.get(index - 1).copied().ok_or(JitError::NotFound),
		}
	}

	pub fn method_by_token(&self, token: MetadataToken) -> Result<&'l Method<'l>> {
		match (token.kind(), token.index()) {
			(_, 0) => Err(JitError::NotFound),
			(MetadataTokenKind::MethodDef, index) => {
				self.defined_methods.get(index - 1).copied().ok_or(JitError::NotFound)
			}
			(MetadataTokenKind::MemberRef, index) => {
				match self.imported_members.get(index - 1) {
					Some(ImportedMember::Method(method)) => Ok(method),
					Some(ImportedMember::Field(_)) => Err(JitError::BadFormat),
					None => Err(JitError::NotFound),
				}
			}
			_ => Err(JitError::BadFormat),
		}
	}

	pub fn field_by_token(&self, token: MetadataToken) -> Result<&'l Field<'l>> {
		match (token.kind(), token.index()) {
			(_, 0) => Err(JitError::NotFound),
			(MetadataTokenKind::Field, index) => {
				self.defined_fields.get(index - 1).copied().ok_or(JitError::NotFound)
			}
			(MetadataTokenKind::MemberRef, index) => {
				match self.imported_members.get(index - 1) {
					Some(ImportedMember::Field(field)) => Ok(field),
					Some(ImportedMember::Method(_)) => Err(JitError::BadFormat),
					None => Err(JitError::NotFound),
				}
			}
			_ => Err(JitError::BadFormat),
		}
	}

	pub fn string_by_token(&self, token: MetadataToken) -> Result<&'l str> {
		match token.kind() {
			MetadataTokenKind::UserString => self
				.user_strings
				.get(&(token.index() as u32))
				.copied()
				.ok_or(JitError::NotFound),
			_ => Err(JitError::BadFormat),
		}
	}
}
