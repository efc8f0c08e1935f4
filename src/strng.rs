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

pub use arcstr::literal;

pub type Strng = arcstr::ArcStr;

pub const EMPTY: Strng = literal!("");

pub fn new<A: AsRef<str>>(s: A) -> Strng {
    Strng::from(s.as_ref())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn literals_and_owned_compare_equal() {
        const A: Strng = literal!("mesh_ca");
        let b = new(String::from("mesh_ca"));
        assert_eq!(A, b);
        assert_eq!(b.to_string(), "mesh_ca");
        assert!(EMPTY.is_empty());
    }
}
