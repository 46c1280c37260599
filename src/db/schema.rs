pub const SCHEMA: &str = r#"
-- Pins: saved map locations. Coordinates are kept as the exact strings the
-- caller supplied so lookups can match them verbatim.
CREATE TABLE IF NOT EXISTS pins (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    latitude TEXT NOT NULL,
    longitude TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pins_coordinate ON pins(latitude, longitude);

-- Photos: search results for a pin, with the image bytes once downloaded
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pin_id INTEGER NOT NULL REFERENCES pins(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    image_url TEXT NOT NULL,
    image BLOB,
    created_at TEXT NOT NULL,
    downloaded_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_photos_pin ON photos(pin_id);
"#;
