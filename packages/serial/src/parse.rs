use nom::error::{
    ContextError as NomContextError, ErrorKind as NomErrorKind, ParseError as NomParseError,
};
use std::fmt;

pub type Input<'a> = &'a [u8];
pub type Result<'a, T> = nom::IResult<Input<'a>, T, Error<Input<'a>>>;

#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    Nom(NomErrorKind),
    Context(&'static str),
}

#[derive(PartialEq)]
pub struct Error<I> {
    pub errors: Vec<(I, ErrorKind)>,
}

impl<I> NomParseError<I> for Error<I> {
    fn from_error_kind(input: I, kind: NomErrorKind) -> Self {
        let errors = vec![(input, ErrorKind::Nom(kind))];
        Self { errors }
    }

    fn append(input: I, kind: NomErrorKind, mut other: Self) -> Self {
        other.errors.push((input, ErrorKind::Nom(kind)));
        other
    }
}

impl<I> NomContextError<I> for Error<I> {
    fn add_context(input: I, ctx: &'static str, mut other: Self) -> Self {
        other.errors.push((input, ErrorKind::Context(ctx)));
        other
    }
}

impl fmt::Debug for Error<Input<'_>> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (input, kind) in self.errors.iter().rev() {
            match kind {
                ErrorKind::Context(ctx) => write!(f, "{} > ", ctx)?,
                ErrorKind::Nom(e) => write!(f, "{:?} at 0x{} > ", e, hex::encode(input))?,
            }
        }
        Ok(())
    }
}
