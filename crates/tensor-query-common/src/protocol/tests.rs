//! Tests for the protocol module
//!
//! These tests cover tensor layout validation, wire codes and the
//! fail-fast envelope accessors.

#[cfg(test)]
mod tests {
    use super::super::*;
    use bytes::Bytes;

    fn float_info(dims: &[u32]) -> TensorInfo {
        TensorInfo::new(TensorType::Float32, dims.to_vec())
    }

    #[test]
    fn test_tensor_type_codes_are_stable() {
        assert_eq!(TensorType::Int32.code(), 0);
        assert_eq!(TensorType::Float32.code(), 7);
        assert_eq!(TensorType::Float16.code(), 10);
        assert_eq!(TensorType::from_code(7), Some(TensorType::Float32));
        assert_eq!(TensorType::from_code(11), None);
    }

    #[test]
    fn test_tensor_type_from_str() {
        assert_eq!("float32".parse::<TensorType>().unwrap(), TensorType::Float32);
        assert_eq!("UINT8".parse::<TensorType>().unwrap(), TensorType::UInt8);
        assert!(matches!(
            "complex64".parse::<TensorType>(),
            Err(QueryError::Malformed(_))
        ));
    }

    #[test]
    fn test_byte_size() {
        assert_eq!(float_info(&[1, 1, 1, 1]).byte_size(), Some(4));
        assert_eq!(
            TensorInfo::new(TensorType::UInt8, vec![3, 224, 224, 1]).byte_size(),
            Some(3 * 224 * 224)
        );
        assert_eq!(
            TensorInfo::new(TensorType::Int64, vec![u32::MAX, u32::MAX, u32::MAX]).byte_size(),
            None
        );
    }

    #[test]
    fn test_layout_total_size() {
        let layout = TensorLayout::new(vec![
            float_info(&[2, 2]),
            TensorInfo::new(TensorType::Int16, vec![3]),
        ]);
        assert_eq!(layout.num_tensors(), 2);
        assert_eq!(layout.total_byte_size(), Some(16 + 6));
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_layout_rejects_too_many_tensors() {
        let layout = TensorLayout::new(vec![float_info(&[1]); TENSOR_SIZE_LIMIT + 1]);
        assert!(matches!(layout.validate(), Err(QueryError::Malformed(_))));
    }

    #[test]
    fn test_layout_rejects_empty() {
        assert!(TensorLayout::default().validate().is_err());
    }

    #[test]
    fn test_tensor_rejects_bad_rank_and_zero_dims() {
        assert!(float_info(&[]).validate().is_err());
        assert!(float_info(&[1, 1, 1, 1, 1]).validate().is_err());
        assert!(float_info(&[4, 0]).validate().is_err());
        assert!(float_info(&[4, 4]).validate().is_ok());
    }

    #[test]
    fn test_tensor_rejects_oversized_buffer() {
        let huge = TensorInfo::new(TensorType::Float64, vec![4096, 4096, 4096]);
        assert!(matches!(huge.validate(), Err(QueryError::Malformed(_))));
    }

    #[test]
    fn test_layout_display() {
        let layout = TensorLayout::new(vec![
            float_info(&[1, 1, 1, 1]),
            TensorInfo::new(TensorType::UInt8, vec![3, 4]),
        ]);
        assert_eq!(layout.to_string(), "float32[1:1:1:1],uint8[3:4]");
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("MQTT".parse::<Protocol>().unwrap(), Protocol::Mqtt);
        assert!(matches!(
            "sctp".parse::<Protocol>(),
            Err(QueryError::UnsupportedTransport(_))
        ));
    }

    #[test]
    fn test_protocol_unit_sizes() {
        assert!(Protocol::Tcp.is_stream());
        assert!(!Protocol::Udp.is_stream());
        assert_eq!(Protocol::Udp.max_unit_size(), MAX_DATAGRAM_SIZE);
        assert_eq!(Protocol::Udp.max_chunk_size(), MAX_DATAGRAM_SIZE - 10);
        assert_eq!(Protocol::Mqtt.max_unit_size(), MAX_MQTT_PAYLOAD);
    }

    #[test]
    fn test_command_kind_codes() {
        for code in 0..5u8 {
            assert_eq!(CommandKind::from_code(code).unwrap().code(), code);
        }
        assert_eq!(CommandKind::from_code(5), None);
        assert_eq!(CommandKind::TransferStart.to_string(), "TRANSFER_START");
    }

    #[test]
    fn test_envelope_accessors_fail_fast() {
        let info = DataInfo::new(TensorLayout::single(float_info(&[1])));
        let start = Envelope::start(Protocol::Tcp, info.clone());
        assert_eq!(start.data_info().unwrap(), &info);
        assert!(matches!(
            start.chunk(),
            Err(QueryError::WrongPayload {
                expected: CommandKind::TransferData,
                actual: CommandKind::TransferStart,
            })
        ));

        let data = Envelope::data(Protocol::Udp, Bytes::from_static(b"abcd"));
        assert_eq!(data.chunk().unwrap().as_ref(), b"abcd");
        assert!(data.data_info().is_err());

        let end = Envelope::end(Protocol::Mqtt);
        assert!(end.data_info().is_err());
        assert!(end.chunk().is_err());
    }

    #[test]
    fn test_data_info_builders() {
        let info = DataInfo::new(TensorLayout::single(float_info(&[2, 2])))
            .with_base_time(-5)
            .with_sent_time(10)
            .with_duration(33)
            .with_timestamps(100, 200);
        assert_eq!(info.base_time, -5);
        assert_eq!(info.sent_time, 10);
        assert_eq!(info.duration, 33);
        assert_eq!((info.dts, info.pts), (100, 200));
        assert_eq!(info.expected_size(), Some(16));
    }

    #[test]
    fn test_tensor_type_serializes_lowercase() {
        let json = serde_json::to_string(&TensorType::Float32).unwrap();
        assert_eq!(json, "\"float32\"");
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(QueryError::Timeout(100).is_recoverable());
        assert!(!QueryError::ConnectionClosed.is_recoverable());
        assert!(!QueryError::Malformed("x".into()).is_recoverable());
    }
}
