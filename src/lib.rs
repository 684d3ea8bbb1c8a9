//! Frame-parallel conversion of neuron compartment reports.
//!
//! A report is read through [`report::ReportReader`], rewritten through
//! [`report::ReportWriter`] by every rank of a [`fabric::Fabric`], and
//! optionally proven equal to its input by [`convert::verify`].

pub mod convert;
pub mod fabric;
pub mod report;
