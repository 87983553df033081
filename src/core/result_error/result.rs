use crate::core::result_error::error::Error;
use crate::core::result_error::{AddFunctionName, AddMsg};
use std::borrow::Cow;

pub type Result<T> = std::result::Result<T, Error>;

impl<R> AddFunctionName for Result<R> {
    fn add_fn_name<S: Into<Cow<'static, str>>>(self, fn_name: S) -> Self {
        self.map_err(|e| e.add_fn_name(fn_name))
    }
}

impl<R, S: Into<Cow<'static, str>>> AddMsg<S> for Result<R> {
    fn add_msg(self, msg: S) -> Self {
        self.map_err(|e| e.add_msg(msg))
    }
}

pub fn convert_error_vec(errors: Vec<Error>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.into())
    }
}
