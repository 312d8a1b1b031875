use std::sync::Arc;

use serde_json::{Value, json};
use server::server_state::ServerState;

async fn spawn_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, Arc::new(ServerState::new())));
    format!("http://{addr}")
}

#[tokio::test]
async fn save_then_read_back() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/session/save"))
        .json(&json!({
            "start_datetime": "2024-05-01T08:00:00Z",
            "stop_datetime": "2024-05-01 08:30:00",
            "travel_distance": 17,
            "weather": 2,
            "hazards": [1, 3],
            "gps_points": []
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");
    let id = body["data"]["id"].as_i64().unwrap();

    let body: Value = client
        .get(format!("{base}/api/session/get/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"]["travel_distance"], 17.0);
    assert_eq!(body["data"]["hazards"], json!([1, 3]));

    let body: Value = client
        .get(format!("{base}/api/session/distance"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"], 17.0);

    let response = client
        .get(format!("{base}/api/session/delete/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{base}/api/session/get/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn invalid_sessions_get_field_errors() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/session/save"))
        .json(&json!({
            "start_datetime": "2024-05-01T09:00:00Z",
            "stop_datetime": "2024-05-01T08:00:00Z"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert!(body["errors"]["datetime"].is_string());

    let response = client
        .post(format!("{base}/api/session/save"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let body: Value = client
        .get(format!("{base}/api/session/all"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"], json!([]));
}
