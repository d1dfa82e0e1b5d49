#[cfg(test)]
mod tests {
    use super::super::*;
    use tensor_query_server::AcceptAll;

    fn parse(args: &[&str]) -> Cli {
        Cli::from_args(&["tensor-query"], args).unwrap()
    }

    #[test]
    fn test_cli_parse_serve_defaults() {
        match parse(&["serve"]).command {
            Commands::Serve(args) => {
                assert_eq!(args.protocol, Protocol::Tcp);
                assert_eq!(args.host, "localhost");
                assert_eq!(args.port, 4953);
                assert!(args.dims.is_none());
                assert_eq!(args.types, "float32");
                assert!(!args.deny);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_mqtt() {
        let cli = parse(&[
            "serve", "--protocol", "mqtt", "--host", "broker", "--port", "1883", "--deny",
        ]);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.protocol, Protocol::Mqtt);
                assert_eq!(args.host, "broker");
                assert_eq!(args.port, 1883);
                assert!(args.deny);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_send() {
        let cli = parse(&[
            "send", "--protocol", "udp", "--dims", "3:224:224", "--type", "uint8",
            "--count", "10", "--timeout-ms", "250",
        ]);
        match cli.command {
            Commands::Send(args) => {
                assert_eq!(args.protocol, Protocol::Udp);
                assert_eq!(args.dims, "3:224:224");
                assert_eq!(args.types, "uint8");
                assert_eq!(args.count, 10);
                assert_eq!(args.timeout_ms, 250);
            }
            _ => panic!("Expected Send command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_protocol() {
        assert!(Cli::from_args(&["tensor-query"], &["send", "--protocol", "quic"]).is_err());
    }

    #[test]
    fn test_parse_dims() {
        assert_eq!(parse_dims("3:224:224").unwrap(), vec![3, 224, 224]);
        assert_eq!(parse_dims("7").unwrap(), vec![7]);
        assert!(matches!(parse_dims("3:x"), Err(QueryError::Malformed(_))));
        assert!(parse_dims("").is_err());
    }

    #[test]
    fn test_parse_layout_shared_type() {
        let layout = parse_layout("2:2,4", "int16").unwrap();
        assert_eq!(layout.num_tensors(), 2);
        assert_eq!(layout.tensors[0], TensorInfo::new(TensorType::Int16, vec![2, 2]));
        assert_eq!(layout.tensors[1], TensorInfo::new(TensorType::Int16, vec![4]));
        assert_eq!(layout.total_byte_size(), Some(16));
    }

    #[test]
    fn test_parse_layout_type_per_tensor() {
        let layout = parse_layout("3:224:224,1:1000", "uint8,float32").unwrap();
        assert_eq!(layout.tensors[0].tensor_type, TensorType::UInt8);
        assert_eq!(layout.tensors[1].tensor_type, TensorType::Float32);
    }

    #[test]
    fn test_parse_layout_rejects_bad_input() {
        assert!(parse_layout("1,2,3", "uint8,float32").is_err());
        assert!(parse_layout("1", "complex").is_err());
        assert!(parse_layout("1:1:1:1:1", "uint8").is_err());
        assert!(parse_layout("0", "uint8").is_err());
    }

    #[tokio::test]
    async fn test_run_send_reports_stats() {
        let server = std::sync::Arc::new(QueryServer::init());
        server.setup(Protocol::Tcp, "127.0.0.1", 0).await.unwrap();
        let (sink, mut buffers) = mpsc::channel(8);
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(AcceptAll, sink).await });

        let port = server.current_port().to_string();
        let cli = parse(&[
            "send", "--host", "127.0.0.1", "--port", &port, "--dims", "2:2", "--type", "uint8",
            "--count", "3",
        ]);
        let Commands::Send(args) = cli.command else {
            panic!("Expected Send command");
        };

        let report = run_send(args).await.unwrap();
        assert_eq!(report.buffers_sent, 3);
        assert!(!report.denied);
        assert_eq!(report.stats.bytes_sent, 12);
        assert_eq!(report.stats.commands_sent, 9);
        assert_eq!(report.endpoint, format!("tcp://127.0.0.1:{}", port));

        for _ in 0..3 {
            let received = buffers.recv().await.unwrap();
            assert_eq!(received.buffer.len(), 4);
        }

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["buffers_sent"], 3);
        server.free().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_send_stops_on_denial() {
        let server = std::sync::Arc::new(QueryServer::init());
        server.setup(Protocol::Tcp, "127.0.0.1", 0).await.unwrap();
        let (sink, _buffers) = mpsc::channel(8);
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(DenyAll, sink).await });

        let port = server.current_port().to_string();
        let cli = parse(&["send", "--host", "127.0.0.1", "--port", &port, "--count", "5"]);
        let Commands::Send(args) = cli.command else {
            panic!("Expected Send command");
        };

        let report = run_send(args).await.unwrap();
        assert!(report.denied);
        assert_eq!(report.buffers_sent, 0);
        assert_eq!(report.stats.bytes_sent, 0);
        server.free().await.unwrap();
    }
}
