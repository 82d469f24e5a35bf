//! Blackrock Bluetooth Generic Attribute Profile engine.
//!
//! Implements the GATT protocol state of a host stack: attribute handle
//! allocation, started service tracking, per-link transport control blocks,
//! client procedures (discovery, read, write, MTU exchange), and server
//! notifications and indications with their confirmation timers. Encoding of
//! ATT PDUs, link management, security, and persistence are provided by the
//! caller through the traits in [`gatt`].

#![warn(missing_debug_implementations)]
#![warn(non_ascii_idents)]
#![warn(single_use_lifetimes)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_lifetimes)]
#![warn(unused_qualifications)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![allow(clippy::enum_glob_use)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![warn(clippy::assertions_on_result_states)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::empty_drop)]
#![warn(clippy::empty_structs_with_brackets)]
#![warn(clippy::exit)]
#![warn(clippy::get_unwrap)]
#![warn(clippy::if_then_some_else_none)]
#![warn(clippy::mod_module_files)]
#![warn(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![warn(clippy::str_to_string)]
#![warn(clippy::todo)]
#![warn(clippy::try_err)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![warn(clippy::unseparated_literal_suffix)]

pub use uuid::*;

pub mod att;
pub mod gatt;
pub mod le;
mod util;
mod uuid;
