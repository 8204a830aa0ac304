mod common;

use common::{ScriptedPeer, WAIT, pipe};
use futures_util::StreamExt;
use conduit_mcp::types::{CompletionArgument, Reference, ServerNotification};
use conduit_mcp::{CapabilityStatus, ClientOptions, ConnectionConfig, McpClient, McpError};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;

/// Connect a client to `peer`, which declares `capabilities` and answers the
/// initial list fetches with empty lists.
async fn connect(capabilities: Value) -> (McpClient, ScriptedPeer) {
    let (transport, mut peer) = pipe();
    let script = async {
        peer.accept_initialize(capabilities.clone()).await;
        if capabilities.get("tools").is_some() {
            peer.answer_empty_list("tools/list", "tools").await;
        }
        if capabilities.get("prompts").is_some() {
            peer.answer_empty_list("prompts/list", "prompts").await;
        }
        if capabilities.get("resources").is_some() {
            peer.answer_empty_list("resources/list", "resources").await;
            peer.answer_empty_list("resources/templates/list", "resourceTemplates")
                .await;
        }
    };
    let (client, ()) = tokio::join!(
        McpClient::connect(transport, ClientOptions::default(), ConnectionConfig::default()),
        script
    );
    (client.unwrap(), peer)
}

#[tokio::test]
async fn prompts_list_follows_cursor() {
    let (client, mut peer) = connect(json!({"prompts": {}})).await;

    let script = async {
        let first = peer.expect("prompts/list").await;
        assert_eq!(first["params"], json!({}));
        peer.reply(
            &first,
            json!({"prompts": [{"name": "a"}, {"name": "b"}], "nextCursor": "c1"}),
        )
        .await;

        let second = peer.expect("prompts/list").await;
        assert_eq!(second["params"], json!({"cursor": "c1"}));
        peer.reply(&second, json!({"prompts": [{"name": "c"}]})).await;
    };
    let (prompts, ()) = tokio::join!(client.list_prompts(), script);

    let names: Vec<_> = prompts.unwrap().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    peer.assert_silent(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn error_on_second_page_fails_whole_list() {
    let (client, mut peer) = connect(json!({"tools": {}})).await;

    let script = async {
        let first = peer.expect("tools/list").await;
        peer.reply(
            &first,
            json!({"tools": [{"name": "a", "inputSchema": {}}], "nextCursor": "next"}),
        )
        .await;
        let second = peer.expect("tools/list").await;
        peer.reply_error(&second, -32603, "backend down").await;
    };
    let (tools, ()) = tokio::join!(client.list_tools(), script);

    match tools {
        Err(McpError::Rpc { code, message, .. }) => {
            assert_eq!(code, -32603);
            assert_eq!(message, "backend down");
        }
        other => panic!("expected Rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn progress_reaches_only_its_caller() {
    let (client, mut peer) = connect(json!({"tools": {}})).await;
    let (tx, mut updates) = mpsc::unbounded_channel();

    let call = client.call_tool_with_progress("index", None, move |progress, total| {
        let _ = tx.send((progress, total));
    });
    let script = async {
        let request = peer.expect("tools/call").await;
        let token = request["params"]["_meta"]["progressToken"].clone();
        assert!(!token.is_null());

        peer.notify(
            "notifications/progress",
            json!({"progressToken": token, "progress": 10, "total": 30}),
        )
        .await;
        peer.notify(
            "notifications/progress",
            json!({"progressToken": "someone-else", "progress": 99}),
        )
        .await;
        peer.notify(
            "notifications/progress",
            json!({"progressToken": token, "progress": 30, "total": 30}),
        )
        .await;
        peer.reply(&request, json!({"content": [{"type": "text", "text": "done"}]}))
            .await;
    };
    let (result, ()) = tokio::join!(call, script);
    assert_eq!(result.unwrap().text_content(), "done");

    let mut seen = Vec::new();
    while let Some(update) = tokio::time::timeout(WAIT, updates.recv()).await.unwrap() {
        seen.push(update);
    }
    assert_eq!(seen, vec![(10.0, Some(30.0)), (30.0, Some(30.0))]);
}

#[tokio::test]
async fn tool_list_changed_refreshes_tools_only() {
    let (transport, mut peer) = pipe();
    let script = async {
        peer.accept_initialize(json!({
            "tools": {"listChanged": true},
            "prompts": {"listChanged": true}
        }))
        .await;
        let tools = peer.expect("tools/list").await;
        peer.reply(&tools, json!({"tools": [{"name": "a", "inputSchema": {}}]}))
            .await;
        let prompts = peer.expect("prompts/list").await;
        peer.reply(&prompts, json!({"prompts": [{"name": "p"}]})).await;
    };
    let (client, ()) = tokio::join!(
        McpClient::connect(transport, ClientOptions::default(), ConnectionConfig::default()),
        script
    );
    let client = client.unwrap();

    let mut tools = client.tools();
    let mut prompts = client.prompts();
    assert_eq!(tools.borrow_and_update().supported().map(Vec::len), Some(1));

    peer.notify("notifications/tools/list_changed", json!({})).await;
    let refetch = peer.expect("tools/list").await;
    peer.reply(
        &refetch,
        json!({"tools": [
            {"name": "a", "inputSchema": {}},
            {"name": "b", "inputSchema": {}}
        ]}),
    )
    .await;
    tokio::time::timeout(WAIT, tools.changed())
        .await
        .unwrap()
        .unwrap();
    let names: Vec<_> = tools
        .borrow_and_update()
        .supported()
        .unwrap()
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(names, vec!["a", "b"]);
    peer.assert_silent(Duration::from_millis(100)).await;

    peer.notify("notifications/prompts/list_changed", json!({})).await;
    let refetch = peer.expect("prompts/list").await;
    peer.reply(&refetch, json!({"prompts": [{"name": "p"}, {"name": "q"}]}))
        .await;
    tokio::time::timeout(WAIT, prompts.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(!tools.has_changed().unwrap());
    peer.assert_silent(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn unchanged_refetch_is_not_republished() {
    let (transport, mut peer) = pipe();
    let script = async {
        peer.accept_initialize(json!({"tools": {"listChanged": true}}))
            .await;
        let tools = peer.expect("tools/list").await;
        peer.reply(&tools, json!({"tools": [{"name": "a", "inputSchema": {}}]}))
            .await;
    };
    let (client, ()) = tokio::join!(
        McpClient::connect(transport, ClientOptions::default(), ConnectionConfig::default()),
        script
    );
    let client = client.unwrap();
    let mut tools = client.tools();
    tools.borrow_and_update();

    peer.notify("notifications/tools/list_changed", json!({})).await;
    let refetch = peer.expect("tools/list").await;
    peer.reply(&refetch, json!({"tools": [{"name": "a", "inputSchema": {}}]}))
        .await;

    assert!(
        tokio::time::timeout(Duration::from_millis(200), tools.changed())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn undeclared_capabilities_fail_locally() {
    let (client, mut peer) = connect(json!({})).await;

    assert_eq!(*client.tools().borrow(), CapabilityStatus::NotSupported);
    assert_eq!(*client.resources().borrow(), CapabilityStatus::NotSupported);

    let errors = [
        client.list_tools().await.map(|_| ()),
        client.call_tool("anything", None).await.map(|_| ()),
        client.list_prompts().await.map(|_| ()),
        client.get_prompt("p", None).await.map(|_| ()),
        client.list_resources().await.map(|_| ()),
        client.list_resource_templates().await.map(|_| ()),
        client.read_resource("file:///etc/hosts").await.map(|_| ()),
        client.subscribe_resource("file:///etc/hosts").await,
        client
            .complete(
                Reference::Resource {
                    uri: "file:///{path}".into(),
                },
                CompletionArgument {
                    name: "path".into(),
                    value: "R".into(),
                },
            )
            .await
            .map(|_| ()),
    ];
    for result in errors {
        assert!(
            matches!(result, Err(McpError::CapabilityNotSupported { .. })),
            "expected CapabilityNotSupported, got {result:?}"
        );
    }
    peer.assert_silent(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn server_requests_are_delivered_and_answered() {
    let (client, mut peer) = connect(json!({})).await;
    let mut requests = client.take_requests().unwrap();

    peer.send(json!({"jsonrpc": "2.0", "id": 40, "method": "roots/list"}))
        .await;
    let incoming = tokio::time::timeout(WAIT, requests.recv())
        .await
        .unwrap()
        .unwrap();
    incoming
        .responder
        .respond_ok(&json!({"roots": [{"uri": "file:///work"}]}));

    let reply = peer.recv().await;
    assert_eq!(reply["id"], 40);
    assert_eq!(reply["result"]["roots"][0]["uri"], "file:///work");
}

#[tokio::test]
async fn split_and_merged_frames_decode() {
    let (client, mut peer) = connect(json!({})).await;
    let mut notes = client.take_notifications().unwrap();

    peer.send_raw(br#"{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info","da"#)
        .await;
    peer.send_raw(
        br#"ta":"x {y} \"z\""}}  {"jsonrpc":"2.0","method":"notifications/resources/updated","params":{"uri":"file:///a"}}"#,
    )
    .await;

    let first = tokio::time::timeout(WAIT, notes.next()).await.unwrap().unwrap();
    match first {
        ServerNotification::LoggingMessage(params) => {
            assert_eq!(params.data, json!("x {y} \"z\""));
        }
        other => panic!("unexpected {other:?}"),
    }
    let second = tokio::time::timeout(WAIT, notes.next()).await.unwrap().unwrap();
    assert!(matches!(second, ServerNotification::ResourceUpdated(_)));
}
