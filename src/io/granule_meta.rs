//! Per-scene imaging geometry from Sentinel-2 granule metadata XML

use crate::io::catalog::{CatalogItem, StacCatalog};
use crate::io::http::HttpClient;
use crate::types::{MosaicError, MosaicResult};
use quick_xml::events::Event;
use quick_xml::Reader;

/// Asset key of the granule metadata document
pub const GRANULE_METADATA_ASSET: &str = "granule_metadata";

/// Band whose mean viewing angles represent the scene (B8, NIR)
const REFERENCE_BAND_ID: &str = "8";

/// Mean sensor viewing geometry of one scene, degrees
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewAngles {
    pub zenith: f64,
    pub azimuth: f64,
}

/// Source of per-scene view angles
pub trait ViewAngleSource: Send + Sync {
    fn view_angles(&self, item: &CatalogItem) -> MosaicResult<ViewAngles>;
}

/// Angles extracted from a granule metadata document
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GranuleAngles {
    pub view: Option<ViewAngles>,
    /// Mean sun zenith/azimuth, when present
    pub sun: Option<(f64, f64)>,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Outside,
    MeanSun,
    MeanView,
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    None,
    Zenith,
    Azimuth,
}

/// Parse mean sun and band-8 mean viewing angles from granule metadata
pub fn parse_granule_angles(xml: &str) -> MosaicResult<GranuleAngles> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut section = Section::Outside;
    let mut field = Field::None;
    let mut zenith = None;
    let mut azimuth = None;
    let mut angles = GranuleAngles::default();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"Mean_Sun_Angle" => {
                    section = Section::MeanSun;
                    zenith = None;
                    azimuth = None;
                }
                b"Mean_Viewing_Incidence_Angle" => {
                    let band = e
                        .try_get_attribute("bandId")
                        .map_err(|e| MosaicError::XmlParsing(e.to_string()))?;
                    let is_reference = match band {
                        Some(attr) => attr
                            .unescape_value()
                            .map(|v| v.trim() == REFERENCE_BAND_ID)
                            .unwrap_or(false),
                        None => false,
                    };
                    if is_reference {
                        section = Section::MeanView;
                        zenith = None;
                        azimuth = None;
                    }
                }
                b"ZENITH_ANGLE" if section != Section::Outside => field = Field::Zenith,
                b"AZIMUTH_ANGLE" if section != Section::Outside => field = Field::Azimuth,
                _ => {}
            },
            Event::Text(t) => {
                if field != Field::None {
                    let text = t.unescape()?;
                    let value: f64 = text.trim().parse().map_err(|_| {
                        MosaicError::Metadata(format!("Non-numeric angle value '{}'", text.trim()))
                    })?;
                    match field {
                        Field::Zenith => zenith = Some(value),
                        Field::Azimuth => azimuth = Some(value),
                        Field::None => {}
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"ZENITH_ANGLE" | b"AZIMUTH_ANGLE" => field = Field::None,
                b"Mean_Sun_Angle" if section == Section::MeanSun => {
                    if let (Some(z), Some(a)) = (zenith, azimuth) {
                        angles.sun = Some((z, a));
                    }
                    section = Section::Outside;
                }
                b"Mean_Viewing_Incidence_Angle" if section == Section::MeanView => {
                    if let (Some(z), Some(a)) = (zenith, azimuth) {
                        angles.view = Some(ViewAngles { zenith: z, azimuth: a });
                    }
                    section = Section::Outside;
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(angles)
}

/// Band-8 mean viewing angles, failing when the document lacks them
pub fn parse_view_angles(xml: &str) -> MosaicResult<ViewAngles> {
    parse_granule_angles(xml)?.view.ok_or_else(|| {
        MosaicError::Metadata("No band-8 Mean_Viewing_Incidence_Angle in granule metadata".to_string())
    })
}

impl<C: HttpClient> ViewAngleSource for StacCatalog<C> {
    fn view_angles(&self, item: &CatalogItem) -> MosaicResult<ViewAngles> {
        let href = item.assets.get(GRANULE_METADATA_ASSET).ok_or_else(|| {
            MosaicError::Metadata(format!("Item {} has no {} asset", item.id, GRANULE_METADATA_ASSET))
        })?;
        let bytes = self.client().get(href)?;
        let xml = String::from_utf8(bytes)
            .map_err(|e| MosaicError::InvalidFormat(format!("Granule metadata is not UTF-8: {}", e)))?;
        parse_view_angles(&xml)
    }
}
