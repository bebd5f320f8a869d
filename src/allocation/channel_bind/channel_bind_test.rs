use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use super::*;
use crate::allocation::five_tuple::FiveTuple;
use crate::allocation::*;
use crate::error::{Error, Result};

async fn create_channel_bind(lifetime: Duration) -> Result<Allocation> {
    let turn_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    let relay_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let relay_addr = relay_socket.local_addr()?;
    let a = Allocation::new(
        turn_socket,
        RelaySocket::Packet(relay_socket),
        relay_addr,
        FiveTuple::default(),
    );

    let addr = SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), 0);
    let c = ChannelBind::new(ChannelNumber(MIN_CHANNEL_NUMBER), addr);

    a.add_channel_bind(c, lifetime).await?;

    Ok(a)
}

#[tokio::test]
async fn test_channel_bind() -> Result<()> {
    let a = create_channel_bind(Duration::from_millis(20)).await?;

    let result = a.get_channel_addr(&ChannelNumber(MIN_CHANNEL_NUMBER)).await;
    if let Some(addr) = result {
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
    } else {
        panic!("expected some, but got none");
    }

    Ok(())
}

#[tokio::test]
async fn test_channel_bind_expires() -> Result<()> {
    let a = create_channel_bind(Duration::from_secs(600)).await?;
    tokio::time::pause();

    tokio::time::advance(Duration::from_secs(599)).await;
    assert!(a
        .get_channel_addr(&ChannelNumber(MIN_CHANNEL_NUMBER))
        .await
        .is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(a
        .get_channel_addr(&ChannelNumber(MIN_CHANNEL_NUMBER))
        .await
        .is_none());

    Ok(())
}

#[tokio::test]
async fn test_channel_bind_refresh() -> Result<()> {
    let a = create_channel_bind(Duration::from_secs(600)).await?;
    tokio::time::pause();

    tokio::time::advance(Duration::from_secs(500)).await;
    let peer = SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), 0);
    a.add_channel_bind(
        ChannelBind::new(ChannelNumber(MIN_CHANNEL_NUMBER), peer),
        Duration::from_secs(600),
    )
    .await?;

    tokio::time::advance(Duration::from_secs(500)).await;
    assert_eq!(
        a.get_channel_number(&peer).await,
        Some(ChannelNumber(MIN_CHANNEL_NUMBER))
    );

    Ok(())
}

#[tokio::test]
async fn test_channel_bind_invalid_number() -> Result<()> {
    let a = create_channel_bind(Duration::from_secs(600)).await?;

    let peer = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 5000);
    let result = a
        .add_channel_bind(
            ChannelBind::new(ChannelNumber(MAX_CHANNEL_NUMBER + 1), peer),
            Duration::from_secs(600),
        )
        .await;
    assert_eq!(result, Err(Error::ErrInvalidChannelNumber));
    assert!(
        !a.has_permission(&peer).await,
        "a rejected bind must not install a permission"
    );

    Ok(())
}
