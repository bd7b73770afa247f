//! marshaller plug-in contract
//!
//! A marshaller turns one call's parameters into wire bytes, an unmarshaller turns the reply
//! bytes back into a value. Both are picked per call. Any closure with the right shape is a
//! marshaller, and `Identity` passes bytes through untouched.
//!
//! ```rust
//! use exec_rpc::marshal::{Identity, Marshaller, Unmarshaller};
//!
//! let bytes = Identity.marshal(&b"hello"[..]).unwrap();
//! let back: Vec<u8> = Identity.unmarshal(bytes).unwrap();
//! assert_eq!(back, b"hello");
//! ```
use std::convert::Infallible;
use std::error::Error as StdError;

/// encode a value of type `T` into the bytes sent to the executor
pub trait Marshaller<T: ?Sized> {
    /// error raised when `T` can't be encoded
    type Error: StdError + Send + Sync + 'static;

    /// encode the value
    fn marshal(&self, value: &T) -> Result<Vec<u8>, Self::Error>;
}

/// decode the bytes returned by the executor into a value of type `T`
pub trait Unmarshaller<T> {
    /// error raised when the bytes can't be decoded
    type Error: StdError + Send + Sync + 'static;

    /// decode the value
    fn unmarshal(&self, bytes: Vec<u8>) -> Result<T, Self::Error>;
}

impl<T, F, E> Marshaller<T> for F
where
    T: ?Sized,
    F: Fn(&T) -> Result<Vec<u8>, E>,
    E: StdError + Send + Sync + 'static,
{
    type Error = E;

    fn marshal(&self, value: &T) -> Result<Vec<u8>, E> {
        self(value)
    }
}

impl<T, F, E> Unmarshaller<T> for F
where
    F: Fn(Vec<u8>) -> Result<T, E>,
    E: StdError + Send + Sync + 'static,
{
    type Error = E;

    fn unmarshal(&self, bytes: Vec<u8>) -> Result<T, E> {
        self(bytes)
    }
}

/// pass-through marshalling, used when a call names no marshaller
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Marshaller<[u8]> for Identity {
    type Error = Infallible;

    fn marshal(&self, value: &[u8]) -> Result<Vec<u8>, Infallible> {
        Ok(value.to_vec())
    }
}

impl Marshaller<Vec<u8>> for Identity {
    type Error = Infallible;

    fn marshal(&self, value: &Vec<u8>) -> Result<Vec<u8>, Infallible> {
        Ok(value.clone())
    }
}

impl Marshaller<str> for Identity {
    type Error = Infallible;

    fn marshal(&self, value: &str) -> Result<Vec<u8>, Infallible> {
        Ok(value.as_bytes().to_vec())
    }
}

impl Marshaller<String> for Identity {
    type Error = Infallible;

    fn marshal(&self, value: &String) -> Result<Vec<u8>, Infallible> {
        Ok(value.as_bytes().to_vec())
    }
}

impl Unmarshaller<Vec<u8>> for Identity {
    type Error = Infallible;

    fn unmarshal(&self, bytes: Vec<u8>) -> Result<Vec<u8>, Infallible> {
        Ok(bytes)
    }
}
