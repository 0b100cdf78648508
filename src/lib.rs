//! NGDP client core
//!
//! Fetches, verifies and installs CDN-distributed game builds. The store is
//! content-addressed and git-like: every object is named by the MD5 of its
//! bytes, raw blocks and metadata are reused across builds and remotes, and
//! nothing unverified is ever committed.
//!
//! The layers, leaves first: [`psv`] parses the catalog tables, [`blte`]
//! decodes the chunked container every data object wears, [`store`] owns
//! the partitioned on-disk tree, [`archive`] locates files packed inside
//! archives, and [`fetch`] plans and drives retrieval over [`cdn`].

pub mod archive;
pub mod blte;
pub mod cdn;
pub mod config;
pub mod error;
pub mod fetch;
pub mod key;
pub mod manifest;
pub mod psv;
pub mod sql;
pub mod store;
