//! Boot parameters.
//!
//! The previous kernel hands the location of the persistent store over on
//! the command line as `pram=<hex frame>`. Other tokens are ignored.

use crate::frame::Pfn;
use crate::kwarn;

/// Persistent-memory parameters parsed from the kernel command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PramParams {
    /// Frame of the first root block, if a store was handed over.
    pub root: Option<Pfn>,
}

impl PramParams {
    /// Parses `pram=<hex>` out of a whitespace-separated command line.
    ///
    /// The value is hexadecimal with an optional `0x` prefix. A value of 0
    /// means no store. An unparsable value is logged and ignored, leaving
    /// the store absent. When the parameter repeats, the last one wins.
    pub fn parse(cmdline: Option<&str>) -> Self {
        let mut params = Self::default();

        let Some(cmdline) = cmdline else {
            return params;
        };

        for token in cmdline.split_whitespace() {
            let Some(value) = token.strip_prefix("pram=") else {
                continue;
            };
            let digits = value
                .strip_prefix("0x")
                .or_else(|| value.strip_prefix("0X"))
                .unwrap_or(value);
            match u64::from_str_radix(digits, 16) {
                Ok(raw) => params.root = Pfn::new(raw).non_null(),
                Err(_) => {
                    kwarn!("PRAM: ignoring malformed parameter '{token}'");
                    params.root = None;
                }
            }
        }

        params
    }
}
