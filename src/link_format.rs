// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! CoRE Link Format (RFC6690) rendering for the discovery resource.

use crate::resource::ResourceTree;

/// Renders the visible resources of `tree` as an `application/link-format`
/// document, one link per resource.
pub fn write_link_format(tree: &ResourceTree) -> String {
    let mut out = String::new();

    for resource in tree.visible() {
        if !out.is_empty() {
            out.push(',');
        }
        out.push('<');
        out.push_str(resource.path());
        out.push('>');

        for (key, value) in resource.attributes() {
            out.push(';');
            out.push_str(key);
            if !value.is_empty() {
                out.push_str("=\"");
                out.push_str(value);
                out.push('"');
            }
        }

        let formats = resource.content_formats();
        if !formats.is_empty() {
            out.push_str(";ct=");
            if formats.len() == 1 {
                out.push_str(&formats[0].0.to_string());
            } else {
                out.push('"');
                let list: Vec<String> =
                    formats.iter().map(|f| f.0.to_string()).collect();
                out.push_str(&list.join(" "));
                out.push('"');
            }
        }

        if resource.is_observable() {
            out.push_str(";obs");
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_format::ContentFormat;
    use crate::resource::Resource;

    #[test]
    fn lists_visible_resources() {
        let mut tree = ResourceTree::new();
        tree.insert("/basic", Resource::new("basic").observable().payload("x"));
        tree.insert(
            "/sensors/temp",
            Resource::new("temp")
                .attribute("rt", "temperature-c")
                .representation(ContentFormat::APPLICATION_JSON, "{}"),
        );
        tree.insert("/secret", Resource::new("secret").hidden());

        let links = write_link_format(&tree);

        assert!(links.contains("</basic>;ct=0;obs"));
        assert!(links.contains("</sensors/temp>;rt=\"temperature-c\";ct=50"));
        assert!(!links.contains("/secret"));
        // Auto-created intermediates stay hidden.
        assert!(!links.contains("</sensors>,"));
    }
}
