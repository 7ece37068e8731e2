//! Integration tests for the OpenStack adapter against a mock Keystone/Nova

use provisioner::error::ProvisionerError;
use provisioner::models::Fields;
use provisioner::providers::openstack::OpenStackConnector;
use provisioner::providers::{ComputeApi, ComputeConnector, NodeSpec, NodeState};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "tok-123";

fn fields(server: &MockServer) -> Fields {
    json!({
        "openstack_username": "admin",
        "openstack_password": "s3cret",
        "openstack_tenant": "dev",
        "openstack_auth_url": format!("{}/v2.0", server.uri()),
    })
    .as_object()
    .cloned()
    .unwrap()
}

/// Keystone answers once; later calls must reuse the token
async fn mount_keystone(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v2.0/tokens"))
        .and(body_json(json!({
            "auth": {
                "passwordCredentials": { "username": "admin", "password": "s3cret" },
                "tenantName": "dev"
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access": {
                "token": { "id": TOKEN },
                "serviceCatalog": [
                    {
                        "type": "identity",
                        "endpoints": [{ "publicURL": format!("{}/v2.0", server.uri()) }]
                    },
                    {
                        "type": "compute",
                        "endpoints": [{ "publicURL": format!("{}/compute/v2/dev/", server.uri()) }]
                    }
                ]
            }
        })))
        .expect(1)
        .mount(server)
        .await;
}

fn client(server: &MockServer) -> Arc<dyn ComputeApi> {
    OpenStackConnector::default().connect(&fields(server)).unwrap()
}

#[tokio::test]
async fn test_create_node() {
    let server = MockServer::start().await;
    mount_keystone(&server).await;

    Mock::given(method("POST"))
        .and(path("/compute/v2/dev/servers"))
        .and(header("X-Auth-Token", TOKEN))
        .and(body_json(json!({
            "server": {
                "name": "node1.example.com",
                "flavorRef": "m1.small",
                "imageRef": "centos-7",
                "security_groups": [{ "name": "default" }, { "name": "ssh" }],
                "key_name": "provisioner"
            }
        })))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "server": { "id": "abc123", "adminPass": "generated" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let node = client(&server)
        .create_node(&NodeSpec {
            name: "node1.example.com".to_string(),
            flavor: "m1.small".to_string(),
            image: "centos-7".to_string(),
            security_groups: vec!["default".to_string(), "ssh".to_string()],
            key_name: Some("provisioner".to_string()),
            ..NodeSpec::default()
        })
        .await
        .unwrap();

    assert_eq!(node.id, "abc123");
    assert_eq!(node.admin_password.as_deref(), Some("generated"));
}

#[tokio::test]
async fn test_get_node_reuses_token() {
    let server = MockServer::start().await;
    mount_keystone(&server).await;

    Mock::given(method("GET"))
        .and(path("/compute/v2/dev/servers/abc123"))
        .and(header("X-Auth-Token", TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "server": {
                "id": "abc123",
                "name": "node1.example.com",
                "status": "ACTIVE",
                "addresses": {
                    "public": [
                        { "addr": "2001:db8::5", "version": 6 },
                        { "addr": "10.0.0.5", "version": 4 }
                    ]
                }
            }
        })))
        .expect(2)
        .mount(&server)
        .await;

    let compute = client(&server);
    compute.get_node("abc123").await.unwrap();
    let node = compute.get_node("abc123").await.unwrap().unwrap();

    assert_eq!(node.state, NodeState::Ready);
    assert_eq!(node.name, "node1.example.com");
    assert_eq!(node.ipv4_address("public"), Some("10.0.0.5"));
}

#[tokio::test]
async fn test_get_missing_node_is_none() {
    let server = MockServer::start().await;
    mount_keystone(&server).await;

    Mock::given(method("GET"))
        .and(path("/compute/v2/dev/servers/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(client(&server).get_node("gone").await.unwrap().is_none());
}

#[tokio::test]
async fn test_destroy_node() {
    let server = MockServer::start().await;
    mount_keystone(&server).await;

    Mock::given(method("DELETE"))
        .and(path("/compute/v2/dev/servers/abc123"))
        .and(header("X-Auth-Token", TOKEN))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/compute/v2/dev/servers/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let compute = client(&server);
    compute.destroy_node("abc123").await.unwrap();

    let err = compute.destroy_node("gone").await.unwrap_err();
    assert!(matches!(err, ProvisionerError::ResourceNotFound(ref id) if id == "gone"));
}

#[tokio::test]
async fn test_rejected_credentials() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v2.0/tokens"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Invalid user / password"))
        .mount(&server)
        .await;

    let err = client(&server).get_node("abc123").await.unwrap_err();
    assert_eq!(err.kind(), "provider_api");
    assert!(err.to_string().contains("401"));
    assert!(err.to_string().contains("Invalid user / password"));
}

#[tokio::test]
async fn test_catalog_without_compute() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v2.0/tokens"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access": { "token": { "id": TOKEN }, "serviceCatalog": [] }
        })))
        .mount(&server)
        .await;

    let err = client(&server).get_node("abc123").await.unwrap_err();
    assert!(err.to_string().contains("No compute endpoint"));
}
