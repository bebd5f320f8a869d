use super::*;
use crate::error::Result;

#[test]
fn test_five_tuple_equal_and_fingerprint() -> Result<()> {
    let src_addr1: SocketAddr = "0.0.0.0:3478".parse::<SocketAddr>()?;
    let src_addr2: SocketAddr = "0.0.0.0:3479".parse::<SocketAddr>()?;

    let dst_addr1: SocketAddr = "0.0.0.0:3480".parse::<SocketAddr>()?;
    let dst_addr2: SocketAddr = "0.0.0.0:3481".parse::<SocketAddr>()?;

    let tests = vec![
        (
            "Equal",
            true,
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
        ),
        (
            "DifferentProtocol",
            false,
            FiveTuple {
                protocol: PROTO_TCP,
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
        ),
        (
            "DifferentSrcAddr",
            false,
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr2,
                dst_addr: dst_addr1,
            },
        ),
        (
            "DifferentDstAddr",
            false,
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr2,
            },
        ),
        (
            "SwappedAddrs",
            false,
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: src_addr1,
                dst_addr: dst_addr1,
            },
            FiveTuple {
                protocol: PROTO_UDP,
                src_addr: dst_addr1,
                dst_addr: src_addr1,
            },
        ),
    ];

    for (name, expect, a, b) in tests {
        let fact = a == b;
        assert_eq!(
            expect, fact,
            "{name}: {a}, {b} equal check should be {expect}, but {fact}"
        );

        let fact = a.fingerprint() == b.fingerprint();
        assert_eq!(
            expect, fact,
            "{name}: {a}, {b} fingerprint check should be {expect}, but {fact}"
        );
    }

    Ok(())
}

#[test]
fn test_five_tuple_fingerprint_format() -> Result<()> {
    let five_tuple = FiveTuple {
        protocol: PROTO_TCP,
        src_addr: "[::1]:5000".parse()?,
        dst_addr: "10.0.0.1:3478".parse()?,
    };

    assert_eq!(five_tuple.fingerprint(), "TCP_[::1]:5000_10.0.0.1:3478");
    assert_eq!(five_tuple.fingerprint(), five_tuple.fingerprint());

    Ok(())
}

#[test]
fn test_five_tuple_validate() -> Result<()> {
    let set: SocketAddr = "127.0.0.1:3478".parse()?;
    let any_port: SocketAddr = "0.0.0.0:3478".parse()?;

    assert_eq!(
        FiveTuple::default().validate(),
        Err(Error::ErrNilFiveTupleSrcAddr)
    );
    assert_eq!(
        FiveTuple {
            src_addr: set,
            ..Default::default()
        }
        .validate(),
        Err(Error::ErrNilFiveTupleDstAddr)
    );
    assert_eq!(
        FiveTuple {
            src_addr: set,
            dst_addr: any_port,
            ..Default::default()
        }
        .validate(),
        Ok(())
    );

    Ok(())
}
