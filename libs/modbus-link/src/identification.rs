//! Device identification paginator
//!
//! A Read Device Identification reply may stop early with "more follows,
//! resume at object X". The paginator keeps asking from the resume id and
//! merges every page into one `DeviceIdentification`, keeping the first value
//! seen for each object id. Any failed page fails the whole read.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::constants::MAX_IDENTIFICATION_PAGES;
use crate::error::{ModbusError, Result};
use crate::pdu::{Request, Response};
use crate::types::{DeviceIdCategory, DeviceIdentification, TransportKind};

/// One request/response round trip
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(&self, request: Request) -> Result<Response>;
}

/// Read the identification objects of `category` starting at `object_id`,
/// following continuations
pub async fn read_device_identification<E>(
    exchanger: &E,
    kind: TransportKind,
    device_id: u8,
    category: DeviceIdCategory,
    mut object_id: u8,
) -> Result<DeviceIdentification>
where
    E: Exchange + ?Sized,
{
    let mut merged: Option<DeviceIdentification> = None;

    for page_no in 1..=MAX_IDENTIFICATION_PAGES {
        let request = Request::read_device_identification(kind, device_id, category, object_id)?;
        let response = exchanger.exchange(request).await?;
        let page = response
            .identification()
            .ok_or_else(|| ModbusError::protocol("reply carries no identification page"))?;

        let identification =
            merged.get_or_insert_with(|| DeviceIdentification::new(page.conformity_level));
        for object in &page.objects {
            if !identification.insert_if_absent(object.clone()) {
                debug!("Device {} repeated object {:02X}, keeping first value", device_id, object.id);
            }
        }

        let Some(next) = response.next_object_id() else {
            debug!(
                "Device {} identification complete: {} objects in {} page(s)",
                device_id,
                identification.len(),
                page_no
            );
            return Ok(merged.unwrap_or_default());
        };

        if next <= object_id {
            warn!(
                "Device {} continuation does not advance: requested {:02X}, resume at {:02X}",
                device_id, object_id, next
            );
            return Err(ModbusError::protocol(format!(
                "identification continuation from {:02X} does not advance past {:02X}",
                next, object_id
            )));
        }
        object_id = next;
    }

    Err(ModbusError::protocol(format!(
        "identification exceeded {} pages",
        MAX_IDENTIFICATION_PAGES
    )))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::codec;
    use crate::pdu::FunctionCode;
    use crate::types::DeviceObjectId;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replies with scripted PDUs and records the requested object ids
    struct ScriptedDevice {
        replies: Mutex<VecDeque<Result<Vec<u8>>>>,
        requested: Mutex<Vec<u8>>,
    }

    impl ScriptedDevice {
        fn new(replies: Vec<Result<Vec<u8>>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Exchange for ScriptedDevice {
        async fn exchange(&self, request: Request) -> Result<Response> {
            assert_eq!(request.function(), FunctionCode::ReadDeviceIdentification);
            self.requested.lock().push(request.mei().unwrap().object_id);
            let pdu = self
                .replies
                .lock()
                .pop_front()
                .expect("unexpected extra request")?;
            codec::decode_response(&request, request.device_id(), None, &pdu)
        }
    }

    /// Build an FC2B/0E reply PDU
    fn page(more_follows: bool, next: u8, objects: &[(u8, &[u8])]) -> Vec<u8> {
        let mut pdu = vec![
            0x2B,
            0x0E,
            0x01,
            0x81,
            if more_follows { 0xFF } else { 0x00 },
            next,
            objects.len() as u8,
        ];
        for (id, value) in objects {
            pdu.push(*id);
            pdu.push(value.len() as u8);
            pdu.extend_from_slice(value);
        }
        pdu
    }

    #[tokio::test]
    async fn test_two_pages_merge() {
        let device = ScriptedDevice::new(vec![
            Ok(page(
                true,
                0x05,
                &[(0x00, b"ACME"), (0x01, b"PX-1"), (0x02, b"1.0"), (0x04, b"Meter")],
            )),
            Ok(page(false, 0x00, &[(0x05, b"M300"), (0x06, b"Feeder A")])),
        ]);

        let id = read_device_identification(&device, TransportKind::Tcp, 1, DeviceIdCategory::Regular, 0x00)
            .await
            .unwrap();

        assert_eq!(*device.requested.lock(), vec![0x00, 0x05]);
        assert_eq!(id.len(), 6);
        let ids: Vec<u8> = id.objects().iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![0x00, 0x01, 0x02, 0x04, 0x05, 0x06]);
        assert_eq!(id.vendor_name().as_deref(), Some("ACME"));
        assert_eq!(id.text(DeviceObjectId::ModelName).as_deref(), Some("M300"));
        assert_eq!(id.conformity_level(), 0x81);
    }

    #[tokio::test]
    async fn test_first_seen_value_retained() {
        let device = ScriptedDevice::new(vec![
            Ok(page(true, 0x02, &[(0x00, b"ACME"), (0x01, b"PX-1")])),
            Ok(page(false, 0x00, &[(0x01, b"OTHER"), (0x02, b"2.1")])),
        ]);

        let id = read_device_identification(&device, TransportKind::Rtu, 7, DeviceIdCategory::Basic, 0x00)
            .await
            .unwrap();
        assert_eq!(id.len(), 3);
        assert_eq!(id.product_code().as_deref(), Some("PX-1"));
        assert_eq!(id.revision().as_deref(), Some("2.1"));
    }

    #[tokio::test]
    async fn test_follow_up_failure_aborts() {
        let device = ScriptedDevice::new(vec![
            Ok(page(true, 0x03, &[(0x00, b"ACME")])),
            Err(ModbusError::timeout("no reply within 1000ms")),
        ]);

        let err = read_device_identification(&device, TransportKind::Tcp, 1, DeviceIdCategory::Regular, 0x00)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_non_advancing_continuation_rejected() {
        let device = ScriptedDevice::new(vec![
            Ok(page(true, 0x03, &[(0x00, b"ACME")])),
            Ok(page(true, 0x03, &[(0x03, b"http://acme")])),
        ]);

        let err = read_device_identification(&device, TransportKind::Tcp, 1, DeviceIdCategory::Extended, 0x00)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_single_page() {
        let device = ScriptedDevice::new(vec![Ok(page(false, 0x00, &[(0x00, b"ACME")]))]);
        let id = read_device_identification(&device, TransportKind::Tcp, 1, DeviceIdCategory::Basic, 0x00)
            .await
            .unwrap();
        assert_eq!(id.len(), 1);
        assert_eq!(*device.requested.lock(), vec![0x00]);
    }

    #[tokio::test]
    async fn test_individual_access_starts_at_requested_object() {
        let device = ScriptedDevice::new(vec![Ok(page(false, 0x00, &[(0x05, b"M300")]))]);
        let id = read_device_identification(
            &device,
            TransportKind::Tcp,
            1,
            DeviceIdCategory::Individual,
            DeviceObjectId::ModelName as u8,
        )
        .await
        .unwrap();
        assert_eq!(*device.requested.lock(), vec![0x05]);
        assert_eq!(id.text(DeviceObjectId::ModelName).as_deref(), Some("M300"));
    }

    #[tokio::test]
    async fn test_continuation_must_pass_start_object() {
        let device = ScriptedDevice::new(vec![Ok(page(true, 0x03, &[(0x04, b"Meter")]))]);
        let err = read_device_identification(&device, TransportKind::Tcp, 1, DeviceIdCategory::Regular, 0x04)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Protocol(_)));
    }
}
