//! GeoTIFF reading and writing on top of the pure-Rust `tiff` crate.
//!
//! Georeferencing is taken from `ModelTransformation` when present, else from
//! `ModelPixelScale` + `ModelTiepoint`. The CRS is reduced to `EPSG:<code>`
//! from the GeoKey directory; nodata comes from the GDAL ASCII tag.
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, DirectoryEncoder, TiffEncoder, TiffKind};
use tiff::tags::Tag;
use tiff::ColorType;

use super::{CategoryRaster, CodedRaster, GeoTransform, PixelWindow, Raster, RasterSource};
use crate::error::{CropSeqError, Result};

// ── Tag numbers ──────────────────────────────────────────────────────────────

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

// GeoKey ids.
const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

// ── Reading ──────────────────────────────────────────────────────────────────

/// A single-band 8-bit GeoTIFF on disk. Metadata is read once at open;
/// pixel data is decoded on demand per window.
#[derive(Debug, Clone)]
pub struct GeoTiffSource {
    path: PathBuf,
    width: usize,
    height: usize,
    transform: GeoTransform,
    crs: Option<String>,
    nodata: Option<u8>,
}

impl GeoTiffSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut decoder = open_decoder(&path)?;
        if decoder.colortype()? != ColorType::Gray(8) {
            return Err(CropSeqError::UnsupportedPixelType(path));
        }
        let (width, height) = decoder.dimensions()?;
        let transform = read_transform(&mut decoder)?;
        let crs = read_crs(&mut decoder)?;
        let nodata = read_nodata(&mut decoder)?.and_then(|v| {
            // Nodata outside the u8 range can never match a pixel.
            (v.fract() == 0.0 && (0.0..=255.0).contains(&v)).then_some(v as u8)
        });
        Ok(Self {
            path,
            width: width as usize,
            height: height as usize,
            transform,
            crs,
            nodata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode the whole image.
    pub fn read_all(&self) -> Result<CategoryRaster> {
        let mut decoder = open_decoder(&self.path)?;
        let data = match decoder.read_image()? {
            DecodingResult::U8(v) => v,
            _ => return Err(CropSeqError::UnsupportedPixelType(self.path.clone())),
        };
        Ok(Raster::from_vec(data, self.width, self.height, self.transform, self.crs.clone())?
            .with_nodata(self.nodata))
    }
}

impl RasterSource for GeoTiffSource {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn transform(&self) -> GeoTransform {
        self.transform
    }

    fn crs(&self) -> Option<String> {
        self.crs.clone()
    }

    fn nodata(&self) -> Option<u8> {
        self.nodata
    }

    /// Decode only the strips/tiles overlapping `window`.
    fn read_window(&self, window: &PixelWindow) -> Result<CategoryRaster> {
        window.check_within(self.width, self.height)?;
        let mut out = Raster::new(
            window.width,
            window.height,
            self.transform.for_window(window),
            self.crs.clone(),
            0u8,
        )
        .with_nodata(self.nodata);
        if window.pixel_count() == 0 {
            return Ok(out);
        }

        let mut decoder = open_decoder(&self.path)?;
        let (chunk_w, chunk_h) = decoder.chunk_dimensions();
        let (chunk_w, chunk_h) = (chunk_w as usize, chunk_h as usize);
        let chunks_across = self.width.div_ceil(chunk_w);

        let win_col_end = window.col_off + window.width;
        let win_row_end = window.row_off + window.height;

        for cy in window.row_off / chunk_h..=(win_row_end - 1) / chunk_h {
            for cx in window.col_off / chunk_w..=(win_col_end - 1) / chunk_w {
                let index = (cy * chunks_across + cx) as u32;
                let data = match decoder.read_chunk(index)? {
                    DecodingResult::U8(v) => v,
                    _ => return Err(CropSeqError::UnsupportedPixelType(self.path.clone())),
                };
                let (data_w, data_h) = decoder.chunk_data_dimensions(index);
                let (data_w, data_h) = (data_w as usize, data_h as usize);

                let chunk_col = cx * chunk_w;
                let chunk_row = cy * chunk_h;
                let col_start = window.col_off.max(chunk_col);
                let col_end = win_col_end.min(chunk_col + data_w);
                let row_start = window.row_off.max(chunk_row);
                let row_end = win_row_end.min(chunk_row + data_h);
                if col_start >= col_end {
                    continue;
                }

                for row in row_start..row_end {
                    let src = (row - chunk_row) * data_w + (col_start - chunk_col);
                    let dst = (row - window.row_off) * window.width + (col_start - window.col_off);
                    let n = col_end - col_start;
                    out.data[dst..dst + n].copy_from_slice(&data[src..src + n]);
                }
            }
        }
        Ok(out)
    }
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path)?;
    Ok(Decoder::new(BufReader::new(file))?)
}

fn read_f64_tag<R: std::io::Read + Seek>(decoder: &mut Decoder<R>, code: u16) -> Result<Option<Vec<f64>>> {
    Ok(decoder.find_tag(tag(code))?.map(|v| v.into_f64_vec()).transpose()?)
}

fn read_transform<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Result<GeoTransform> {
    if let Some(m) = read_f64_tag(decoder, MODEL_TRANSFORMATION)? {
        if m.len() >= 8 {
            return Ok(GeoTransform {
                origin_x: m[3],
                pixel_width: m[0],
                row_rotation: m[1],
                origin_y: m[7],
                col_rotation: m[4],
                pixel_height: m[5],
            });
        }
    }

    let scale = read_f64_tag(decoder, MODEL_PIXEL_SCALE)?;
    let tie = read_f64_tag(decoder, MODEL_TIEPOINT)?;
    match (scale, tie) {
        (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => {
            // Tiepoint maps raster (I, J) to model (X, Y).
            let (i, j, x, y) = (t[0], t[1], t[3], t[4]);
            Ok(GeoTransform {
                origin_x: x - i * s[0],
                pixel_width: s[0],
                row_rotation: 0.0,
                origin_y: y + j * s[1],
                col_rotation: 0.0,
                pixel_height: -s[1],
            })
        }
        _ => Ok(GeoTransform::default()),
    }
}

fn read_crs<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<String>> {
    let Some(value) = decoder.find_tag(tag(GEO_KEY_DIRECTORY))? else {
        return Ok(None);
    };
    let keys = value.into_u16_vec()?;
    Ok(epsg_from_geokeys(&keys).map(|code| format!("EPSG:{code}")))
}

/// EPSG code from a GeoKey directory (header of 4 shorts, then 4-short entries).
/// Only keys stored inline (location 0) are considered.
fn epsg_from_geokeys(keys: &[u16]) -> Option<u16> {
    let n = *keys.get(3)? as usize;
    let mut geographic = None;
    for entry in keys.get(4..4 + n * 4)?.chunks_exact(4) {
        let (id, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 {
            continue;
        }
        match id {
            PROJECTED_CS_TYPE => return Some(value),
            GEOGRAPHIC_TYPE => geographic = Some(value),
            _ => {}
        }
    }
    geographic
}

fn read_nodata<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<f64>> {
    let Some(value) = decoder.find_tag(tag(GDAL_NODATA))? else {
        return Ok(None);
    };
    let text = value.into_string()?;
    Ok(text.trim_matches(char::from(0)).trim().parse::<f64>().ok())
}

// ── Writing ──────────────────────────────────────────────────────────────────

/// Write a coded raster as a single-band 32-bit GeoTIFF.
pub fn write_coded_raster(path: impl AsRef<Path>, raster: &CodedRaster) -> Result<()> {
    let file = BufWriter::new(File::create(path.as_ref())?);
    let mut tiff = TiffEncoder::new(file)?;
    let mut image = tiff.new_image::<colortype::Gray32>(raster.width as u32, raster.height as u32)?;
    write_georef(image.encoder(), &raster.transform, raster.crs.as_deref(), raster.nodata.map(f64::from))?;
    image.write_data(&raster.data)?;
    Ok(())
}

/// Write a category raster as a single-band 8-bit GeoTIFF.
pub fn write_category_raster(path: impl AsRef<Path>, raster: &CategoryRaster) -> Result<()> {
    let file = BufWriter::new(File::create(path.as_ref())?);
    let mut tiff = TiffEncoder::new(file)?;
    let mut image = tiff.new_image::<colortype::Gray8>(raster.width as u32, raster.height as u32)?;
    write_georef(image.encoder(), &raster.transform, raster.crs.as_deref(), raster.nodata.map(f64::from))?;
    image.write_data(&raster.data)?;
    Ok(())
}

/// Read a 32-bit coded GeoTIFF written by [`write_coded_raster`].
pub fn read_coded_raster(path: impl AsRef<Path>) -> Result<CodedRaster> {
    let path = path.as_ref();
    let mut decoder = open_decoder(path)?;
    let (width, height) = decoder.dimensions()?;
    let transform = read_transform(&mut decoder)?;
    let crs = read_crs(&mut decoder)?;
    let nodata = read_nodata(&mut decoder)?.map(|v| v as u32);
    let data = match decoder.read_image()? {
        DecodingResult::U32(v) => v,
        _ => return Err(CropSeqError::UnsupportedPixelType(path.to_path_buf())),
    };
    Ok(Raster::from_vec(data, width as usize, height as usize, transform, crs)?.with_nodata(nodata))
}

fn write_georef<W: Write + Seek, K: TiffKind>(
    encoder: &mut DirectoryEncoder<'_, W, K>,
    transform: &GeoTransform,
    crs: Option<&str>,
    nodata: Option<f64>,
) -> Result<()> {
    if transform.row_rotation == 0.0 && transform.col_rotation == 0.0 {
        let scale = [transform.pixel_width, -transform.pixel_height, 0.0];
        let tie = [0.0, 0.0, 0.0, transform.origin_x, transform.origin_y, 0.0];
        encoder.write_tag(tag(MODEL_PIXEL_SCALE), &scale[..])?;
        encoder.write_tag(tag(MODEL_TIEPOINT), &tie[..])?;
    } else {
        let t = transform;
        let m = [
            t.pixel_width, t.row_rotation, 0.0, t.origin_x,
            t.col_rotation, t.pixel_height, 0.0, t.origin_y,
            0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        encoder.write_tag(tag(MODEL_TRANSFORMATION), &m[..])?;
    }

    if let Some(code) = crs.and_then(parse_epsg) {
        encoder.write_tag(tag(GEO_KEY_DIRECTORY), &geokeys_for_epsg(code)[..])?;
    }
    if let Some(nd) = nodata {
        encoder.write_tag(tag(GDAL_NODATA), nd.to_string().as_str())?;
    }
    Ok(())
}

/// Parse `EPSG:<code>` (case-insensitive prefix).
pub fn parse_epsg(crs: &str) -> Option<u16> {
    let (prefix, code) = crs.split_once(':')?;
    if !prefix.eq_ignore_ascii_case("epsg") {
        return None;
    }
    code.trim().parse().ok()
}

fn geokeys_for_epsg(code: u16) -> Vec<u16> {
    // EPSG 4000–4999 are geographic 2D systems.
    let geographic = (4000..5000).contains(&code);
    let (model_type, crs_key) = if geographic {
        (2, GEOGRAPHIC_TYPE)
    } else {
        (1, PROJECTED_CS_TYPE)
    };
    vec![
        1, 1, 0, 3,
        GT_MODEL_TYPE, 0, 1, model_type,
        GT_RASTER_TYPE, 0, 1, 1,
        crs_key, 0, 1, code,
    ]
}
