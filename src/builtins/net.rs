//! Network built-ins: CIDR containment and overlap over IPv4/IPv6.

use super::{err, sig, Builtin, BuiltinContext, BuiltinError, Type};
use crate::value::Value;
use std::net::IpAddr;

pub(super) fn builtins() -> Vec<Builtin> {
    vec![
        Builtin::pure(
            "net.cidr_contains",
            sig(&[Type::String, Type::String], Type::Boolean),
            cidr_contains,
        ),
        Builtin::pure(
            "net.cidr_overlap",
            sig(&[Type::String, Type::String], Type::Boolean),
            cidr_overlap,
        ),
    ]
}

/// A parsed CIDR block: base address bits plus prefix length.
struct Cidr {
    bits: u128,
    prefix: u32,
    v4: bool,
}

impl Cidr {
    fn parse(s: &str) -> Result<Cidr, BuiltinError> {
        let (addr_text, prefix_text) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_text
            .parse()
            .map_err(|_| err(format!("invalid address '{addr_text}'")))?;
        let (bits, width, v4) = match addr {
            IpAddr::V4(a) => (u128::from(u32::from(a)), 32, true),
            IpAddr::V6(a) => (u128::from(a), 128, false),
        };
        let prefix = match prefix_text {
            Some(p) => p
                .parse::<u32>()
                .ok()
                .filter(|p| *p <= width)
                .ok_or_else(|| err(format!("invalid prefix length '{p}'")))?,
            None => width,
        };
        Ok(Cidr {
            bits: bits & Self::mask(prefix, width),
            prefix,
            v4,
        })
    }

    fn width(&self) -> u32 {
        if self.v4 {
            32
        } else {
            128
        }
    }

    fn mask(prefix: u32, width: u32) -> u128 {
        if prefix == 0 {
            0
        } else {
            let shift = width - prefix;
            let ones = !0u128 >> (128 - width);
            (ones >> shift) << shift
        }
    }

    /// Whether `other`'s network is inside this block.
    fn contains(&self, other: &Cidr) -> bool {
        if self.v4 != other.v4 || other.prefix < self.prefix {
            return false;
        }
        let mask = Self::mask(self.prefix, self.width());
        (other.bits & mask) == self.bits
    }
}

fn cidr_contains(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let cidr = Cidr::parse(
        args.first()
            .and_then(Value::as_str)
            .ok_or_else(|| err("net.cidr_contains: cidr must be a string"))?,
    )?;
    let target = Cidr::parse(
        args.get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| err("net.cidr_contains: address must be a string"))?,
    )?;
    Ok(Value::Bool(cidr.contains(&target)))
}

fn cidr_overlap(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let a = Cidr::parse(
        args.first()
            .and_then(Value::as_str)
            .ok_or_else(|| err("net.cidr_overlap: cidr must be a string"))?,
    )?;
    let b = Cidr::parse(
        args.get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| err("net.cidr_overlap: cidr must be a string"))?,
    )?;
    Ok(Value::Bool(a.contains(&b) || b.contains(&a)))
}

#[cfg(test)]
mod tests {
    use crate::builtins::testutil::call;
    use crate::value::Value;

    #[test]
    fn test_contains_address() {
        assert_eq!(
            call(
                "net.cidr_contains",
                &[Value::string("10.0.0.0/8"), Value::string("10.1.2.3")]
            )
            .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call(
                "net.cidr_contains",
                &[Value::string("10.0.0.0/8"), Value::string("11.0.0.1")]
            )
            .unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_contains_subnet() {
        assert_eq!(
            call(
                "net.cidr_contains",
                &[Value::string("10.0.0.0/8"), Value::string("10.2.0.0/16")]
            )
            .unwrap(),
            Value::Bool(true)
        );
        // Wider prefixes are not contained by narrower ones.
        assert_eq!(
            call(
                "net.cidr_contains",
                &[Value::string("10.0.0.0/16"), Value::string("10.0.0.0/8")]
            )
            .unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_overlap() {
        assert_eq!(
            call(
                "net.cidr_overlap",
                &[Value::string("10.0.0.0/16"), Value::string("10.0.0.0/8")]
            )
            .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call(
                "net.cidr_overlap",
                &[Value::string("10.0.0.0/16"), Value::string("10.1.0.0/16")]
            )
            .unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_ipv6() {
        assert_eq!(
            call(
                "net.cidr_contains",
                &[Value::string("2001:db8::/32"), Value::string("2001:db8::1")]
            )
            .unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_mixed_families_do_not_match() {
        assert_eq!(
            call(
                "net.cidr_contains",
                &[Value::string("10.0.0.0/8"), Value::string("2001:db8::1")]
            )
            .unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_invalid_input() {
        assert!(call(
            "net.cidr_contains",
            &[Value::string("not-an-ip"), Value::string("10.0.0.1")]
        )
        .is_err());
    }
}
