//! FORTRAN 77 front end and CAL back end.
//!
//! The library compiles fixed-form FORTRAN 77 source into CAL (Cray
//! Assembly Language) text for an X-MP-class machine. The main entry
//! point is [`compile::compile`], which drives whole program units
//! through classification, expression evaluation, storage layout, and
//! code emission.

pub mod compile;
pub mod error;
pub mod util;
