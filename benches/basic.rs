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

use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};

use mesh_sds::ca::CaManager;
use mesh_sds::ca::builtin::{self, BuiltinCaManager};
use mesh_sds::mesh::CaBackend;
use mesh_sds::sds::{format_version, parse_version};
use mesh_sds::secrets::{IDENTITY_CERT, Secret};
use mesh_sds::strng;

pub fn version(c: &mut Criterion) {
    let mut c = c.benchmark_group("version");
    let version = format_version(1_700_000_000_123_456_789, "ca-1");
    c.bench_function("parse", |b| {
        b.iter(|| parse_version(std::hint::black_box(&version)).unwrap())
    });
}

pub fn secrets(c: &mut Criterion) {
    let mut c = c.benchmark_group("secrets");
    c.measurement_time(Duration::from_secs(5));
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let ca = BuiltinCaManager::new(Duration::from_secs(60 * 60));
    let backend = CaBackend {
        name: strng::new("ca-1"),
        type_: strng::new(builtin::TYPE),
        conf: Default::default(),
    };
    let services = vec![strng::new("backend"), strng::new("web")];
    let pair = rt
        .block_on(ca.generate_workload_cert("default", &backend, &services))
        .unwrap();
    let roots = rt.block_on(ca.root_certs("default", &backend)).unwrap();
    let mut pem_certs = vec![pair.cert_pem.clone()];
    pem_certs.extend(roots);
    let secret = Secret::IdentityCert {
        pem_certs,
        pem_key: pair.key_pem.clone(),
    };

    c.bench_function("encode", |b| {
        b.iter(|| secret.to_any(IDENTITY_CERT.as_str()))
    });
    let any = secret.to_any(IDENTITY_CERT.as_str());
    c.bench_function("decode", |b| b.iter(|| Secret::from_any(&any).unwrap()));
    c.bench_function("sign-workload-cert", |b| {
        b.to_async(&rt).iter(|| async {
            ca.generate_workload_cert("default", &backend, &services)
                .await
                .unwrap()
        })
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_millis(1));
    targets = version, secrets
}

criterion_main!(benches);
