//! Binary build manifests
//!
//! The decoded payloads referenced by a `build-config`. The planner needs
//! exactly two capabilities out of them: resolving a content key to its
//! encoded key ([`encoding`]) and iterating install entries with tag
//! filtering ([`install`]).

pub mod encoding;
pub mod install;
