use std::{
    net::{Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use wiremock::matchers::{header_regex, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use xscan::probe::{HttpProbeClient, ProbeClient, ProbeError, local_socks_url};

/// Minimal no-auth SOCKS5 CONNECT relay standing in for the proxy core.
async fn spawn_socks5() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((client, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = relay(client).await;
            });
        }
    });
    port
}

async fn relay(mut client: TcpStream) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; usize::from(greeting[1])];
    client.read_exact(&mut methods).await?;
    client.write_all(&[5, 0]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        1 => {
            let mut addr = [0u8; 4];
            client.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        3 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; usize::from(len[0])];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        4 => {
            let mut addr = [0u8; 16];
            client.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        _ => return Ok(()),
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    let mut upstream = TcpStream::connect((host.as_str(), port)).await?;
    client.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

#[tokio::test]
async fn success_through_socks_proxy_reports_latency() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/generate_204"))
        .and(header_regex("user-agent", "Chrome/"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let proxy_port = spawn_socks5().await;

    let latency_ms = HttpProbeClient::default()
        .probe(
            &local_socks_url(proxy_port),
            &format!("{}/generate_204", server.uri()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert!(latency_ms < 5_000);
}

#[tokio::test]
async fn non_2xx_is_a_status_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let proxy_port = spawn_socks5().await;

    let err = HttpProbeClient::default()
        .probe(
            &local_socks_url(proxy_port),
            &server.uri(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

    assert_eq!(err, ProbeError::Status { status: 503 });
}

#[tokio::test]
async fn slow_target_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    let proxy_port = spawn_socks5().await;

    let err = HttpProbeClient::default()
        .probe(
            &local_socks_url(proxy_port),
            &server.uri(),
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();

    assert_eq!(err, ProbeError::Timeout);
}
