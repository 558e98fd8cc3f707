use std::path::PathBuf;

use serde_json::json;

/// A small storefront with three known product listings.
pub const PRODUCT_PAGE: &str = r#"<html><head><title>Acme Store</title></head>
<body>
<h1>Acme Store</h1>
<ul class="products">
  <li class="product"><span class="name">Widget</span> <span class="price">$9.99</span></li>
  <li class="product"><span class="name">Gadget Pro</span> <span class="price">$24.50</span></li>
  <li class="product"><span class="name">Thingamajig</span> <span class="price">$3.00</span></li>
</ul>
<a href="/cart">Cart</a>
<img src="/img/banner.png" alt="banner">
</body></html>
"#;

/// Target record shape for product extraction.
pub fn product_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["products"],
        "properties": {
            "products": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name", "price"],
                    "properties": {
                        "name": { "type": "string", "description": "Product name" },
                        "price": { "type": "number", "description": "Price in dollars" }
                    }
                }
            }
        }
    })
}

/// The listing encoded in [`PRODUCT_PAGE`].
pub fn expected_products() -> serde_json::Value {
    json!({
        "products": [
            { "name": "Widget", "price": 9.99 },
            { "name": "Gadget Pro", "price": 24.5 },
            { "name": "Thingamajig", "price": 3.0 }
        ]
    })
}

/// A temp directory holding `products.html` with [`PRODUCT_PAGE`].
pub fn fixture_dir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("products.html");
    std::fs::write(&path, PRODUCT_PAGE).expect("write fixture page");
    (dir, path)
}
