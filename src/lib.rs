//! Core scan-verify-upload pipeline for the MyData desktop agent: discovers
//! instrument datafiles, registers their metadata on a remote archive, and
//! uploads anything new or incomplete.

pub mod cache;
pub mod controller;
pub mod events;
pub mod logging;
pub mod model;
pub mod remote;
pub mod scan;
pub mod settings;
pub mod transfer;
pub mod upload;
pub mod verify;
