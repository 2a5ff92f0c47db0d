//! 执行引擎集成测试：脚本化模型 + 临时工作区

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use hive::core::{
        ChannelPermissionHandler, ExecutionController, ExecutionState, PermissionResponse,
    };
    use hive::engine::{AgentLoop, AgentOptions, AgentResult, ChatMode, StopReason};
    use hive::llm::{ModelTurn, ProviderError, ProviderSlot, ScriptedProvider};
    use hive::memory::Message;
    use hive::tools::{
        register_builtin_tools, McpCallResult, McpContent, McpSession, McpTool, McpToolInfo, ToolCall,
        ToolRegistry,
    };

    fn registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, Vec::new(), 10).unwrap();
        Arc::new(registry)
    }

    fn options(provider: Arc<ScriptedProvider>, workspace: &Path) -> AgentOptions {
        AgentOptions::new(ProviderSlot::new("primary", "model-a", provider), workspace)
    }

    fn write_call(id: &str, path: &str, content: &str) -> ToolCall {
        ToolCall::new(id, "write_file", json!({"path": path, "content": content}))
    }

    fn spawn_run(mut agent: AgentLoop, prompt: &str) -> tokio::task::JoinHandle<AgentResult> {
        let messages = vec![Message::user(prompt)];
        tokio::spawn(async move { agent.run(messages).await })
    }

    async fn wait_for_state(controller: &ExecutionController, state: ExecutionState) {
        let mut rx = controller.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_completion_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        let mut agent = AgentLoop::new(options(provider.clone(), dir.path()), registry());

        let result = agent.run(vec![Message::user("hello")]).await;
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert!(result.success);
        assert_eq!(result.final_response, "");
        assert_eq!(result.iterations, 1);
        assert_eq!(result.final_state, ExecutionState::Running);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_tool_round_trip_then_answer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "alpha\nbeta\n").unwrap();
        let provider = Arc::new(ScriptedProvider::from_turns([
            ModelTurn::tool_calls(vec![ToolCall::new("c1", "read_file", json!({"path": "notes.txt"}))]),
            ModelTurn::text("two lines"),
        ]));
        let mut agent = AgentLoop::new(options(provider.clone(), dir.path()), registry());

        let result = agent.run(vec![Message::user("count lines")]).await;
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.final_response, "two lines");
        assert_eq!(result.iterations, 2);
        assert_eq!(result.tool_calls.len(), 1);
        assert!(result.tool_calls[0].result.success);

        // 第二次请求带上工具结果
        let second = &provider.requests()[1].messages;
        let tool_msg = second.last().unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
        assert!(tool_msg.content.contains("beta"));
    }

    #[tokio::test]
    async fn test_max_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        for i in 0..5 {
            provider.push_turn(ModelTurn::tool_calls(vec![ToolCall::new(
                format!("c{i}"),
                "list_dir",
                json!({}),
            )]));
        }
        let mut agent = AgentLoop::new(
            options(provider.clone(), dir.path()).with_max_iterations(3),
            registry(),
        );

        let result = agent.run(vec![Message::user("loop forever")]).await;
        assert_eq!(result.stop_reason, StopReason::MaxIterations);
        assert!(!result.success);
        assert_eq!(result.iterations, 3);
        assert_eq!(result.tool_calls.len(), 3);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_consecutive_errors_stop_run() {
        let dir = tempfile::tempdir().unwrap();
        let calls = (0..4)
            .map(|i| ToolCall::new(format!("c{i}"), "read_file", json!({"path": format!("missing{i}.txt")})))
            .collect();
        let provider = Arc::new(ScriptedProvider::from_turns([ModelTurn::tool_calls(calls)]));
        let mut agent = AgentLoop::new(options(provider, dir.path()), registry());

        let result = agent.run(vec![Message::user("read them")]).await;
        assert_eq!(result.stop_reason, StopReason::ConsecutiveErrors);
        assert_eq!(result.tool_calls.len(), 3);
        assert!(result.tool_calls.iter().all(|r| !r.result.success));
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_error_streak() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "ok").unwrap();
        let calls = vec![
            ToolCall::new("c1", "read_file", json!({"path": "nope1"})),
            ToolCall::new("c2", "read_file", json!({"path": "nope2"})),
            ToolCall::new("c3", "read_file", json!({"path": "ok.txt"})),
            ToolCall::new("c4", "no_such_tool", json!({})),
            ToolCall::new("c5", "read_file", json!({"wrong": 1})),
        ];
        let provider = Arc::new(ScriptedProvider::from_turns([
            ModelTurn::tool_calls(calls),
            ModelTurn::text("done"),
        ]));
        let mut agent = AgentLoop::new(options(provider, dir.path()), registry());

        let result = agent.run(vec![Message::user("mixed")]).await;
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.tool_calls.len(), 5);
        assert_eq!(
            result.tool_calls[3].result.error.as_deref(),
            Some("Unknown tool: no_such_tool")
        );
    }

    #[tokio::test]
    async fn test_quota_switches_to_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let primary = Arc::new(ScriptedProvider::new());
        primary.push_error(ProviderError::http(429, r#"{"error":{"code":"insufficient_quota"}}"#));
        let backup = Arc::new(ScriptedProvider::from_turns([ModelTurn::text("from backup")]));
        let opts = options(primary.clone(), dir.path())
            .with_fallback(ProviderSlot::new("backup", "model-b", backup.clone()));
        let mut agent = AgentLoop::new(opts, registry());

        let result = agent.run(vec![Message::user("hi")]).await;
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.final_response, "from backup");
        assert_eq!(result.iterations, 1);
        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.calls(), 1);
        assert_eq!(backup.requests()[0].model, "model-b");
    }

    #[tokio::test]
    async fn test_fatal_provider_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_error(ProviderError::http(401, "invalid api key"));
        let mut agent = AgentLoop::new(options(provider.clone(), dir.path()), registry());

        let result = agent.run(vec![Message::user("hi")]).await;
        assert_eq!(result.stop_reason, StopReason::Error);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("401"));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_honors_retry_after() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_error(ProviderError::http(429, "rate limit reached").with_header("retry-after", "2"));
        provider.push_turn(ModelTurn::text("after wait"));
        let mut agent = AgentLoop::new(options(provider.clone(), dir.path()), registry());

        let started = tokio::time::Instant::now();
        let result = agent.run(vec![Message::user("hi")]).await;
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.final_response, "after wait");
        assert_eq!(result.iterations, 1);
        assert_eq!(provider.calls(), 2);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_count_as_failures() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        for _ in 0..4 {
            provider.push_error(ProviderError::transport("connection reset"));
        }
        let mut agent = AgentLoop::new(
            options(provider.clone(), dir.path()).with_error_threshold(1),
            registry(),
        );

        let result = agent.run(vec![Message::user("hi")]).await;
        assert_eq!(result.stop_reason, StopReason::ConsecutiveErrors);
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test]
    async fn test_abort_with_rollback_in_step_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();
        let provider = Arc::new(ScriptedProvider::from_turns([
            ModelTurn::tool_calls(vec![
                write_call("w1", "a.txt", "new"),
                write_call("w2", "sub/b.txt", "created"),
            ]),
            ModelTurn::text("unreachable"),
        ]));
        let agent = AgentLoop::new(
            options(provider, dir.path()).with_auto_approve(true),
            registry(),
        );
        let controller = agent.controller();
        let journal = agent.journal();
        controller.toggle_step_mode();

        let handle = spawn_run(agent, "edit files");
        wait_for_state(&controller, ExecutionState::WaitingStep).await;
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "new");
        assert!(controller.advance_step());

        wait_for_state(&controller, ExecutionState::WaitingStep).await;
        assert!(dir.path().join("sub/b.txt").exists());
        assert_eq!(journal.len(), 2);
        assert!(controller.abort_with_rollback());

        let result = handle.await.unwrap();
        assert_eq!(result.stop_reason, StopReason::Aborted);
        assert_eq!(result.final_state, ExecutionState::Stopped);
        assert_eq!(result.tool_calls.len(), 2);
        let report = result.rollback.unwrap();
        assert_eq!(report.undone, 2);
        assert!(report.failures.is_empty());
        assert!(journal.is_empty());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "old");
        assert!(!dir.path().join("sub/b.txt").exists());
    }

    #[tokio::test]
    async fn test_timed_out_write_is_still_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();
        let big = "x".repeat(8 * 1024 * 1024);
        let provider = Arc::new(ScriptedProvider::from_turns([
            ModelTurn::tool_calls(vec![write_call("w1", "a.txt", &big)]),
            ModelTurn::text("unreachable"),
        ]));
        let agent = AgentLoop::new(
            options(provider, dir.path())
                .with_auto_approve(true)
                .with_tool_timeout(Duration::from_millis(1)),
            registry(),
        );
        let controller = agent.controller();
        controller.toggle_step_mode();

        let handle = spawn_run(agent, "overwrite");
        wait_for_state(&controller, ExecutionState::WaitingStep).await;
        // 被超时丢弃的写入可能仍在阻塞线程池上收尾
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(controller.abort_with_rollback());

        let result = handle.await.unwrap();
        assert_eq!(result.stop_reason, StopReason::Aborted);
        assert_eq!(result.tool_calls.len(), 1);
        assert!(result.rollback.is_some());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "old");
    }

    #[tokio::test]
    async fn test_abort_between_runs_does_not_leak() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::from_turns([
            ModelTurn::text("first"),
            ModelTurn::text("second"),
        ]));
        let mut agent = AgentLoop::new(options(provider.clone(), dir.path()), registry());
        let controller = agent.controller();

        let first = agent.run(vec![Message::user("one")]).await;
        assert_eq!(first.stop_reason, StopReason::Completed);
        // 运行结束后才到达的 Ctrl+C
        assert!(controller.abort());

        let second = agent.run(vec![Message::user("two")]).await;
        assert_eq!(second.stop_reason, StopReason::Completed);
        assert_eq!(second.final_response, "second");
        assert_eq!(second.final_state, ExecutionState::Running);
        assert_eq!(provider.calls(), 2);
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_waiting_for_model() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            ScriptedProvider::from_turns([ModelTurn::text("too late")])
                .with_latency(Duration::from_secs(60)),
        );
        let agent = AgentLoop::new(options(provider.clone(), dir.path()), registry());
        let controller = agent.controller();

        let handle = spawn_run(agent, "hi");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.calls(), 1);
        assert!(controller.abort());

        let result = handle.await.unwrap();
        assert_eq!(result.stop_reason, StopReason::Aborted);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.final_response, "");
        assert_eq!(provider.calls(), 1);
        assert_eq!(provider.remaining(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_retry_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_error(ProviderError::http(429, "rate limit reached").with_header("retry-after", "600"));
        provider.push_turn(ModelTurn::text("never sent"));
        let agent = AgentLoop::new(options(provider.clone(), dir.path()), registry());
        let controller = agent.controller();

        let started = tokio::time::Instant::now();
        let handle = spawn_run(agent, "hi");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(controller.abort());

        let result = handle.await.unwrap();
        assert_eq!(result.stop_reason, StopReason::Aborted);
        assert_eq!(provider.calls(), 1);
        assert_eq!(provider.remaining(), 1);
        assert!(started.elapsed() < Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_plain_abort_keeps_changes() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::from_turns([ModelTurn::tool_calls(vec![
            write_call("w1", "keep.txt", "kept"),
            write_call("w2", "never.txt", "x"),
        ])]));
        let agent = AgentLoop::new(
            options(provider, dir.path()).with_auto_approve(true),
            registry(),
        );
        let controller = agent.controller();
        controller.toggle_step_mode();

        let handle = spawn_run(agent, "write");
        wait_for_state(&controller, ExecutionState::WaitingStep).await;
        controller.abort();

        let result = handle.await.unwrap();
        assert_eq!(result.stop_reason, StopReason::Aborted);
        assert!(result.rollback.is_none());
        assert_eq!(result.tool_calls.len(), 1);
        assert!(dir.path().join("keep.txt").exists());
        assert!(!dir.path().join("never.txt").exists());
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::from_turns([ModelTurn::text("resumed")]));
        let agent = AgentLoop::new(options(provider.clone(), dir.path()), registry());
        let controller = agent.controller();
        assert!(controller.toggle_pause());

        let handle = spawn_run(agent, "hi");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert_eq!(provider.calls(), 0);

        assert!(controller.toggle_pause());
        let result = handle.await.unwrap();
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.final_response, "resumed");
    }

    #[tokio::test]
    async fn test_permission_pending_without_handler_until_abort() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::from_turns([ModelTurn::tool_calls(vec![write_call(
            "w1", "x.txt", "data",
        )])]));
        let agent = AgentLoop::new(options(provider, dir.path()), registry());
        let controller = agent.controller();
        let gate = agent.permission_gate();

        let handle = spawn_run(agent, "write");
        let mut pending = gate.subscribe_pending();
        tokio::time::timeout(Duration::from_secs(5), pending.wait_for(|p| p.is_some()))
            .await
            .unwrap()
            .unwrap();
        let request = gate.pending().unwrap();
        assert_eq!(request.tool, "write_file");
        assert_eq!(request.path.as_deref(), Some("x.txt"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        controller.abort();
        let result = handle.await.unwrap();
        assert_eq!(result.stop_reason, StopReason::Aborted);
        assert!(result.tool_calls.is_empty());
        assert!(gate.pending().is_none());
        assert!(!dir.path().join("x.txt").exists());
    }

    #[tokio::test]
    async fn test_denied_write_is_reported_to_model() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::from_turns([
            ModelTurn::tool_calls(vec![write_call("w1", "x.txt", "data")]),
            ModelTurn::text("ok, skipped"),
        ]));
        let agent = AgentLoop::new(options(provider.clone(), dir.path()), registry());
        let (handler, mut prompts) = ChannelPermissionHandler::new();
        agent.permission_gate().register_handler(Arc::new(handler)).unwrap();
        tokio::spawn(async move {
            while let Some(prompt) = prompts.recv().await {
                prompt.respond(PermissionResponse::deny());
            }
        });

        let result = spawn_run(agent, "write").await.unwrap();
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert_eq!(result.final_response, "ok, skipped");
        let denied = &result.tool_calls[0].result;
        assert!(!denied.success);
        assert_eq!(denied.error.as_deref(), Some("Permission denied by user"));
        assert!(!dir.path().join("x.txt").exists());

        let fed_back = provider.requests()[1].messages.last().unwrap().content.clone();
        assert_eq!(fed_back, "Error: Permission denied by user");
    }

    #[tokio::test]
    async fn test_remembered_approval_skips_second_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::from_turns([
            ModelTurn::tool_calls(vec![write_call("w1", "a.txt", "1"), write_call("w2", "b.txt", "2")]),
            ModelTurn::text("done"),
        ]));
        let agent = AgentLoop::new(options(provider, dir.path()), registry());
        let (handler, mut prompts) = ChannelPermissionHandler::new();
        agent.permission_gate().register_handler(Arc::new(handler)).unwrap();
        let answered = tokio::spawn(async move {
            let mut count = 0;
            while let Some(prompt) = prompts.recv().await {
                count += 1;
                prompt.respond(PermissionResponse::approve_and_remember());
            }
            count
        });

        let result = spawn_run(agent, "write both").await.unwrap();
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert!(result.tool_calls.iter().all(|r| r.result.success));
        assert!(dir.path().join("a.txt").exists());
        assert!(dir.path().join("b.txt").exists());
        // 运行结束后 AgentLoop 被释放，通道关闭
        assert_eq!(answered.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_plan_mode_ends_with_plan() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::from_turns([
            ModelTurn::tool_calls(vec![ToolCall::new("p0", "list_dir", json!({}))]),
            ModelTurn::tool_calls(vec![ToolCall::new(
                "p1",
                "submit_plan",
                json!({"plan": "1. add tests\n2. refactor"}),
            )]),
        ]));
        let mut agent = AgentLoop::new(
            options(provider.clone(), dir.path()).with_chat_mode(ChatMode::Plan),
            registry(),
        );

        let result = agent.run(vec![Message::user("plan a refactor")]).await;
        assert_eq!(result.stop_reason, StopReason::PlanApproval);
        assert!(result.success);
        assert_eq!(result.final_response, "1. add tests\n2. refactor");

        let offered: Vec<String> = provider.requests()[0].tools.iter().map(|t| t.name.clone()).collect();
        assert!(offered.contains(&"submit_plan".to_string()));
        assert!(offered.contains(&"read_file".to_string()));
        assert!(!offered.contains(&"write_file".to_string()));
        assert!(!offered.contains(&"shell".to_string()));
    }

    #[tokio::test]
    async fn test_gated_tool_rejected_in_plan_mode() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(ScriptedProvider::from_turns([
            ModelTurn::tool_calls(vec![write_call("w1", "x.txt", "data")]),
            ModelTurn::text("understood"),
        ]));
        let mut agent = AgentLoop::new(
            options(provider, dir.path())
                .with_chat_mode(ChatMode::Plan)
                .with_auto_approve(true),
            registry(),
        );

        let result = agent.run(vec![Message::user("write")]).await;
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert!(!result.tool_calls[0].result.success);
        assert!(!dir.path().join("x.txt").exists());
    }

    struct DocsSession;

    #[async_trait::async_trait]
    impl McpSession for DocsSession {
        fn server_name(&self) -> &str {
            "docs"
        }

        async fn list_tools(&self) -> Result<Vec<McpToolInfo>, String> {
            Ok(vec![McpToolInfo {
                name: "search_docs".to_string(),
                description: Some("Search the docs".to_string()),
                input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
            }])
        }

        async fn call_tool(&self, _name: &str, args: serde_json::Value) -> Result<McpCallResult, String> {
            Ok(McpCallResult {
                content: vec![McpContent::Text {
                    text: format!("hits for {}", args["q"].as_str().unwrap_or_default()),
                }],
                is_error: false,
            })
        }
    }

    #[tokio::test]
    async fn test_trusted_mcp_tool_runs_without_handler_in_plan_mode() {
        let dir = tempfile::tempdir().unwrap();
        let session: Arc<dyn McpSession> = Arc::new(DocsSession);
        let info = session.list_tools().await.unwrap().remove(0);
        let mut tools = ToolRegistry::new();
        register_builtin_tools(&mut tools, Vec::new(), 10).unwrap();
        tools
            .register_mcp("docs", Arc::new(McpTool::new(info, session).trusted()))
            .unwrap();

        let provider = Arc::new(ScriptedProvider::from_turns([
            ModelTurn::tool_calls(vec![ToolCall::new("m1", "search_docs", json!({"q": "retry"}))]),
            ModelTurn::text("found it"),
        ]));
        let mut agent = AgentLoop::new(
            options(provider.clone(), dir.path()).with_chat_mode(ChatMode::Plan),
            Arc::new(tools),
        );
        assert!(!agent.permission_gate().has_handler());

        let result = tokio::time::timeout(Duration::from_secs(5), agent.run(vec![Message::user("look")]))
            .await
            .expect("trusted tool must not wait for approval");
        assert_eq!(result.stop_reason, StopReason::Completed);
        assert!(result.tool_calls[0].result.success);
        assert_eq!(result.tool_calls[0].result.output, "hits for retry");
        assert!(provider.requests()[0].tools.iter().any(|t| t.name == "search_docs"));
    }
}
