// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::fmt::Formatter;

pub use types::*;

use self::discovery::DiscoveryRequest;

mod types;

/// Renders a NACK carried on a request for logging.
pub struct DisplayErrorDetail<'a>(pub &'a google::rpc::Status);

impl fmt::Display for DisplayErrorDetail<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = self.0;
        write!(
            f,
            "code: {:?}, message: {:?}",
            tonic::Code::from_i32(s.code),
            s.message
        )
    }
}

/// Returns the node id presented on a request, or "" when the node is missing.
pub fn node_id(req: &DiscoveryRequest) -> &str {
    req.node.as_ref().map(|n| n.id.as_str()).unwrap_or_default()
}

/// Returns the nonce a request acknowledges, if any.
pub fn acked_nonce(req: &DiscoveryRequest) -> Option<&str> {
    if req.response_nonce.is_empty() {
        None
    } else {
        Some(req.response_nonce.as_str())
    }
}

/// Builds an Any envelope for a resource of the given type.
pub fn to_any<M: prost::Message>(type_url: &str, msg: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::base::Node;

    #[test]
    fn node_id_defaults_to_empty() {
        let mut req = DiscoveryRequest::default();
        assert_eq!(node_id(&req), "");
        req.node = Some(Node {
            id: "default.backend-01".to_string(),
            ..Default::default()
        });
        assert_eq!(node_id(&req), "default.backend-01");
    }

    #[test]
    fn ack_nonce() {
        let mut req = DiscoveryRequest::default();
        assert_eq!(acked_nonce(&req), None);
        req.response_nonce = "3".to_string();
        assert_eq!(acked_nonce(&req), Some("3"));
    }

    #[test]
    fn error_detail_display() {
        let status = google::rpc::Status {
            code: tonic::Code::InvalidArgument as i32,
            message: "bad secret".to_string(),
            details: vec![],
        };
        assert_eq!(
            DisplayErrorDetail(&status).to_string(),
            "code: InvalidArgument, message: \"bad secret\""
        );
    }
}
