//! Error handling and result types.
//!
//! Provides the crate-wide error type and helper traits for adding context
//! to errors as they propagate out of the backup machinery.

use std::borrow::Cow;

pub mod error;
pub mod result;

pub trait AddFunctionName {
    fn add_fn_name<S: Into<Cow<'static, str>>>(self, fn_name: S) -> Self;
}

pub trait AddMsg<S: Into<Cow<'static, str>>> {
    fn add_msg(self, msg: S) -> Self;
}
