mod common;

use common::*;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn chained_proxies_each_add_via() {
    let origin = start_origin("a").await;
    let outer = start_proxy(test_config()).await;
    let mut config = test_config();
    config.chain.upstreams = vec![outer.addr.to_string()];
    config.proxy.via_alias = "inner".to_string();
    let inner = start_proxy(config).await;

    let client = proxied_client(&inner);
    let res = client
        .get(format!("http://{}/through", origin.authority()))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    let via: Vec<_> = res
        .headers()
        .get_all("via")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(via, vec!["1.1 relay-proxy".to_string(), "1.1 inner".to_string()]);
    assert_eq!(res.text().await.unwrap(), "a /through");

    let seen = origin.requests();
    assert_eq!(
        seen[0].header_values("via"),
        vec!["1.1 inner".to_string(), "1.1 relay-proxy".to_string()]
    );
}

#[tokio::test]
async fn fails_over_to_next_chained_proxy() {
    let origin = start_origin("a").await;
    let outer = start_proxy(test_config()).await;
    let dead = unused_addr().await;
    let mut config = test_config();
    config.chain.upstreams = vec![dead.to_string(), outer.addr.to_string()];
    let inner = start_proxy(config).await;

    let client = proxied_client(&inner);
    let res = client
        .get(format!("http://{}/retry", origin.authority()))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "a /retry");
    assert!(inner.stats.snapshot().connect_failures_total >= 1);
}

#[tokio::test]
async fn connect_is_forwarded_through_chained_proxy() {
    let echo = start_echo_server().await;
    let outer = start_proxy(test_config()).await;
    let mut config = test_config();
    config.chain.upstreams = vec![outer.addr.to_string()];
    let inner = start_proxy(config).await;
    let mut client = connect(&inner).await;

    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    client.get_mut().write_all(request.as_bytes()).await.unwrap();

    let mut status = String::new();
    client.read_line(&mut status).await.unwrap();
    assert!(status.starts_with("HTTP/1.1 200"));
    loop {
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        if line.trim_end().is_empty() {
            break;
        }
    }

    client.get_mut().write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");
    assert_eq!(outer.stats.snapshot().tunnels_total, 1);
}
