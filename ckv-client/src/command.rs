//! Command construction.
//!
//! A [`Cmd`] is an owned argument vector plus the keys it touches. Keys are
//! kept separately so routing and error reporting never have to guess which
//! arguments are keys.

use std::time::Duration;

/// Conversion into a single binary-safe argument.
pub trait ToArg {
    fn to_arg(&self) -> Vec<u8>;
}

impl ToArg for str {
    fn to_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Vec<u8> {
        self.clone()
    }
}

impl<const N: usize> ToArg for [u8; N] {
    fn to_arg(&self) -> Vec<u8> {
        self.to_vec()
    }
}

macro_rules! int_to_arg {
    ($($ty:ty),*) => {
        $(impl ToArg for $ty {
            fn to_arg(&self) -> Vec<u8> {
                self.to_string().into_bytes()
            }
        })*
    };
}

int_to_arg!(i32, i64, u32, u64, usize, u128);

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Vec<u8> {
        (**self).to_arg()
    }
}

/// An owned command ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    args: Vec<Vec<u8>>,
    keys: Vec<String>,
}

impl Cmd {
    /// Starts a command with its name.
    pub fn new(name: &str) -> Self {
        Cmd {
            args: vec![name.as_bytes().to_vec()],
            keys: Vec::new(),
        }
    }

    /// Appends a plain argument.
    pub fn arg<A: ToArg + ?Sized>(mut self, arg: &A) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    /// Appends a key argument and records it for routing.
    pub fn key(mut self, key: &str) -> Self {
        self.args.push(key.as_bytes().to_vec());
        self.keys.push(key.to_string());
        self
    }

    /// Appends several keys.
    pub fn keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        for key in keys {
            self = self.key(key.as_ref());
        }
        self
    }

    /// Appends owned bytes without copying.
    pub fn bytes(mut self, data: Vec<u8>) -> Self {
        self.args.push(data);
        self
    }

    /// Appends a duration in whole milliseconds, never below 1.
    pub fn millis(self, d: Duration) -> Self {
        let ms = d.as_millis().max(1);
        self.arg(&ms)
    }

    pub fn push_arg<A: ToArg + ?Sized>(&mut self, arg: &A) {
        self.args.push(arg.to_arg());
    }

    pub fn push_key(&mut self, key: &str) {
        self.args.push(key.as_bytes().to_vec());
        self.keys.push(key.to_string());
    }

    /// Argument vector, command name first.
    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Keys this command touches, in argument order.
    pub fn key_names(&self) -> &[String] {
        &self.keys
    }

    /// Upper-cased command name.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_arguments_and_keys() {
        let cmd = Cmd::new("SET")
            .key("k")
            .bytes(b"v".to_vec())
            .arg("PX")
            .millis(Duration::from_micros(10));
        assert_eq!(
            cmd.args(),
            [
                b"SET".to_vec(),
                b"k".to_vec(),
                b"v".to_vec(),
                b"PX".to_vec(),
                b"1".to_vec()
            ]
        );
        assert_eq!(cmd.key_names(), ["k".to_string()]);
        assert_eq!(cmd.name(), "SET");
    }
}
