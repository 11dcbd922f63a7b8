//! Accessibility checks applied to every member token the translator
//! resolves, per ECMA-335 II.8.5.

use crate::model::method::Method;
use crate::model::types::{Field, MemberAccess, Type, TypeVisibility};

fn is_same_family<'a>(from: &Type<'a>, to: &Type<'a>) -> bool {
	let mut current = Some(from);
	while let Some(ty) = current {
		if std::ptr::eq(ty, to) {
			return true;
		}
		current = ty.base_type.get();
	}
	false
}

fn is_same_assembly<'a>(from: &Type<'a>, to: &Type<'a>) -> bool {
	from.assembly_name == to.assembly_name
}

pub fn check_type_visibility<'a>(from: &Type<'a>, to: &Type<'a>) -> bool {
	match to.visibility() {
		TypeVisibility::Public => return true,
		TypeVisibility::NotPublic => return is_same_assembly(from, to),
		_ => {}
	}

	// nested visibilities are relative to the declaring type
	let Some(declaring) = to.declaring_type.get() else {
		return false;
	};

	let family = is_same_family(from, declaring);
	let assembly = is_same_assembly(from, declaring);

	match to.visibility() {
		TypeVisibility::NestedPrivate => std::ptr::eq(from, declaring),
		TypeVisibility::NestedFamily => family,
		TypeVisibility::NestedAssembly => assembly,
		TypeVisibility::NestedFamilyAndAssembly => family && assembly,
		TypeVisibility::NestedFamilyOrAssembly => family || assembly,
		TypeVisibility::NestedPublic => true,
		TypeVisibility::Public | TypeVisibility::NotPublic => unreachable!(),
	}
}

fn check_member_access<'a>(from: &Type<'a>, declaring: &Type<'a>, access: MemberAccess) -> bool {
	let family = is_same_family(from, declaring);
	let assembly = is_same_assembly(from, declaring);

	match access {
		MemberAccess::CompilerControlled => false,
		MemberAccess::Private => std::ptr::eq(from, declaring),
		MemberAccess::Family => family,
		MemberAccess::Assembly => assembly,
		MemberAccess::FamilyAndAssembly => family && assembly,
		MemberAccess::FamilyOrAssembly => family || assembly,
		MemberAccess::Public => true,
	}
}

pub fn check_field_accessibility<'a>(from: &Type<'a>, to: &Field<'a>) -> bool {
	let Some(declaring) = to.declaring_type.get() else {
		return false;
	};
	if !check_type_visibility(from, declaring) {
		return false;
	}
	check_member_access(from, declaring, to.access())
}

pub fn check_method_accessibility<'a>(from: &Type<'a>, to: &Method<'a>) -> bool {
	let Some(declaring) = to.declaring_type.get() else {
		return false;
	};
	if !check_type_visibility(from, declaring) {
		return false;
	}
	check_member_access(from, declaring, to.access())
}
